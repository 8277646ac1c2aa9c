//! Agent process collaborator.
//!
//! [`AgentLauncher`] runs one agent invocation for a workflow, forwarding
//! partial text through a [`DeltaSink`] in the order the process emitted it,
//! and resolves to the final [`Completion`]. [`ClaudeLauncher`] spawns the
//! `claude` CLI in `stream-json` mode and decodes its JSONL output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::workflow::{Completion, Event, EventKind, SessionBinding, WorkflowId};
use crate::error::SpeckitError;
use crate::io::config::SpeckitConfig;
use crate::io::process::command_from_line;

const COLLABORATOR: &str = "agent";
const STDERR_LIMIT_BYTES: u64 = 64 * 1024;

/// One agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub workflow_id: WorkflowId,
    pub prompt: String,
    pub session: Option<SessionBinding>,
}

/// Forwards partial output of one workflow into the executor's event queue.
#[derive(Debug, Clone)]
pub struct DeltaSink {
    workflow_id: WorkflowId,
    events: mpsc::UnboundedSender<Event>,
}

impl DeltaSink {
    pub fn new(workflow_id: WorkflowId, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            workflow_id,
            events,
        }
    }

    pub fn emit(&self, text: impl Into<String>) {
        let event = Event::new(
            self.workflow_id.clone(),
            Utc::now(),
            EventKind::StreamDelta(text.into()),
        );
        if self.events.send(event).is_err() {
            debug!(workflow_id = %self.workflow_id, "event queue closed, delta discarded");
        }
    }
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Run the agent to completion, cancellation, or timeout.
    ///
    /// `Err` means the process could not be started at all.
    async fn run(
        &self,
        request: LaunchRequest,
        sink: DeltaSink,
        cancel: CancellationToken,
    ) -> Result<Completion>;
}

/// Launcher for the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeLauncher {
    command_line: String,
    permission_mode: String,
    max_turns: u32,
    timeout: Duration,
    workdir: PathBuf,
}

impl ClaudeLauncher {
    pub fn new(cfg: &SpeckitConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command_line: cfg.agent_command.clone(),
            permission_mode: cfg.permission_mode.clone(),
            max_turns: cfg.agent_max_turns,
            timeout: cfg.agent_timeout(),
            workdir: workdir.into(),
        }
    }

    /// CLI arguments for `request`, after the configured command.
    pub fn args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--include-partial-messages".to_string(),
            "--permission-mode".to_string(),
            self.permission_mode.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if let Some(session) = &request.session {
            let flag = if session.resume {
                "--resume"
            } else {
                "--session-id"
            };
            args.push(flag.to_string());
            args.push(session.id.clone());
        }
        args
    }
}

#[async_trait]
impl AgentLauncher for ClaudeLauncher {
    #[instrument(skip_all, fields(workflow_id = %request.workflow_id))]
    async fn run(
        &self,
        request: LaunchRequest,
        sink: DeltaSink,
        cancel: CancellationToken,
    ) -> Result<Completion> {
        let std_cmd = command_from_line(&self.command_line)
            .ok_or_else(|| SpeckitError::collaborator(COLLABORATOR, "agent_command is empty"))?;
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.args(self.args(&request))
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            SpeckitError::collaborator(COLLABORATOR, format!("spawn {}: {err}", self.command_line))
        })?;
        info!("agent started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("agent stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("agent stderr was not piped"))?;
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.take(STDERR_LIMIT_BYTES).read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut decoder = StreamDecoder::default();
        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let interrupt = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Some(Interrupt::Cancelled),
                _ = &mut deadline => break Some(Interrupt::TimedOut),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(text) = decoder.decode_line(&line) {
                            sink.emit(text);
                        }
                    }
                    Ok(None) => break None,
                    Err(err) => {
                        warn!(err = %err, "agent stdout read failed");
                        break None;
                    }
                },
            }
        };

        let status = match interrupt {
            None => tokio::select! {
                status = child.wait() => Some(status.context("wait for agent")?),
                _ = cancel.cancelled() => None,
                _ = &mut deadline => None,
            },
            Some(_) => None,
        };

        let Some(status) = status else {
            let interrupt = interrupt.unwrap_or(if cancel.is_cancelled() {
                Interrupt::Cancelled
            } else {
                Interrupt::TimedOut
            });
            warn!(?interrupt, "stopping agent");
            if let Err(err) = child.kill().await {
                warn!(err = %err, "failed to kill agent");
            }
            return Ok(interrupt.completion(&decoder, self.timeout));
        };

        let stderr = stderr_reader.await.unwrap_or_default();
        let completion = decoder.finish(status.success(), &stderr);
        debug!(success = completion.success, exit_code = ?status.code(), "agent finished");
        Ok(completion)
    }
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    TimedOut,
}

impl Interrupt {
    fn completion(self, decoder: &StreamDecoder, timeout: Duration) -> Completion {
        let error = match self {
            Interrupt::Cancelled => "cancelled".to_string(),
            Interrupt::TimedOut => format!("timed out after {}s", timeout.as_secs()),
        };
        Completion {
            success: false,
            session_id: decoder.session_id.clone(),
            error: Some(error),
            ..Completion::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    event: Option<PartialEvent>,
    #[serde(default)]
    message: Option<AssistantMessage>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<f64>,
    #[serde(default)]
    is_error: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PartialEvent {
    #[serde(default)]
    delta: Option<TextDelta>,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Incremental decoder for `--output-format stream-json` lines.
///
/// Partial `stream_event` deltas are preferred; whole `assistant` messages are
/// only surfaced when no partial delta has been seen, so text is never doubled.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    saw_partial: bool,
    session_id: Option<String>,
    result: Option<ResultSummary>,
}

#[derive(Debug, Clone, PartialEq)]
struct ResultSummary {
    is_error: bool,
    text: Option<String>,
    cost_usd: Option<f64>,
    duration_secs: Option<f64>,
}

impl StreamDecoder {
    /// Text to forward for one output line, if any. Non-JSON lines are skipped.
    pub fn decode_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let parsed: StreamLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(err = %err, "skipping non-json agent output");
                return None;
            }
        };
        if let Some(session_id) = &parsed.session_id {
            self.session_id = Some(session_id.clone());
        }

        match parsed.kind.as_str() {
            "stream_event" => {
                let text = parsed.event?.delta?.text?;
                self.saw_partial = true;
                (!text.is_empty()).then_some(text)
            }
            "assistant" if !self.saw_partial => {
                let texts: Vec<String> = parsed
                    .message?
                    .content
                    .into_iter()
                    .filter_map(|block| block.text)
                    .collect();
                (!texts.is_empty()).then(|| texts.join("\n"))
            }
            "result" => {
                self.result = Some(ResultSummary {
                    is_error: parsed.is_error.unwrap_or(false),
                    text: parsed.result,
                    cost_usd: parsed.total_cost_usd,
                    duration_secs: parsed.duration_ms.map(|ms| ms / 1000.0),
                });
                None
            }
            _ => None,
        }
    }

    /// Completion for a process that exited on its own.
    pub fn finish(&self, exit_success: bool, stderr: &str) -> Completion {
        let reported_error = self.result.as_ref().is_some_and(|r| r.is_error);
        let success = exit_success && !reported_error;
        let error = (!success).then(|| {
            self.result
                .as_ref()
                .filter(|r| r.is_error)
                .and_then(|r| r.text.clone())
                .or_else(|| {
                    let stderr = stderr.trim();
                    (!stderr.is_empty()).then(|| stderr.to_string())
                })
                .unwrap_or_else(|| "agent exited unsuccessfully".to_string())
        });
        Completion {
            success,
            cost_usd: self.result.as_ref().and_then(|r| r.cost_usd),
            duration_secs: self.result.as_ref().and_then(|r| r.duration_secs),
            session_id: self.session_id.clone(),
            error,
        }
    }
}

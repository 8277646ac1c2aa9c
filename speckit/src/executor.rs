//! Effect executor for the workflow reducer.
//!
//! [`WorkflowExecutor`] owns the authoritative [`AppState`] and a single event
//! queue. Every event goes through [`reduce`] one at a time; the resulting
//! effects are carried out here: `LaunchAgent` spawns one tokio task per
//! workflow, `TerminateProcess` cancels that task's token. Agent tasks feed
//! their deltas and final completion back into the same queue, so each
//! workflow's output arrives in the order its process produced it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::workflow::{
    AppState, Completion, Effect, Event, EventKind, SessionBinding, Transition, WorkflowId,
    WorkflowKind, WorkflowRequest, WorkflowStatus, reduce,
};
use crate::error::SpeckitError;
use crate::io::agent::{AgentLauncher, DeltaSink, LaunchRequest};
use crate::io::session_store::SessionStore;

/// How a new workflow binds to an agent conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Branch whose session to use. Pipeline steps default to their feature branch.
    pub branch: Option<String>,
    /// Drop the branch's session and start a new conversation under a new id.
    pub fresh: bool,
}

/// Resolve the session a workflow on `branch` should run in.
///
/// The branch keeps one id for its whole life. The agent resumes it once a
/// conversation exists and otherwise starts one with `--session-id`. Only
/// `fresh` rotates the id.
pub fn bind_session(
    sessions: &SessionStore,
    branch: &str,
    fresh: bool,
) -> Result<SessionBinding, SpeckitError> {
    if fresh {
        sessions.clear(branch)?;
    }
    let id = sessions.get_or_create(branch)?;
    let resume = sessions
        .record(branch)
        .is_some_and(|record| record.has_conversation());
    Ok(SessionBinding { id, resume })
}

pub struct WorkflowExecutor {
    state: AppState,
    launcher: Arc<dyn AgentLauncher>,
    sessions: Arc<SessionStore>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    running: HashMap<WorkflowId, CancellationToken>,
    branches: HashMap<WorkflowId, String>,
    tasks: JoinSet<()>,
    task_workflows: HashMap<task::Id, WorkflowId>,
    dropped_events: u64,
    next_seq: u64,
}

impl WorkflowExecutor {
    pub fn new(launcher: Arc<dyn AgentLauncher>, sessions: Arc<SessionStore>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: AppState::default(),
            launcher,
            sessions,
            events_tx,
            events_rx,
            running: HashMap::new(),
            branches: HashMap::new(),
            tasks: JoinSet::new(),
            task_workflows: HashMap::new(),
            dropped_events: 0,
            next_seq: 0,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Events the reducer refused: unknown ids, terminal workflows, duplicate starts.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Queue for events produced outside the executor.
    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Queue a new workflow and return its id. Nothing runs until [`Self::run`].
    pub fn start(&mut self, kind: WorkflowKind, options: StartOptions) -> Result<WorkflowId> {
        let branch = options
            .branch
            .or_else(|| kind.branch().map(str::to_string));
        let session = branch
            .as_deref()
            .map(|branch| bind_session(&self.sessions, branch, options.fresh))
            .transpose()
            .context("bind agent session")?;

        self.next_seq += 1;
        let workflow_id = WorkflowId::new(format!("wf-{}", self.next_seq));
        if let Some(branch) = branch {
            self.branches.insert(workflow_id.clone(), branch);
        }
        self.submit(
            workflow_id.clone(),
            EventKind::StartRequested(WorkflowRequest { kind, session }),
        );
        Ok(workflow_id)
    }

    pub fn cancel(&self, workflow_id: &WorkflowId) {
        self.submit(workflow_id.clone(), EventKind::CancelRequested);
    }

    pub fn focus(&self, workflow_id: &WorkflowId) {
        self.submit(workflow_id.clone(), EventKind::Focus);
    }

    /// Process events until every workflow is terminal and no agent task is left.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(&CancellationToken::new(), |_, _| {}).await
    }

    /// Like [`Self::run`], with two hooks.
    ///
    /// Cancelling `interrupt` requests cancellation of every workflow that is
    /// not yet terminal. `on_delta` sees each delta the reducer accepted.
    #[instrument(skip_all)]
    pub async fn run_until<D>(
        &mut self,
        interrupt: &CancellationToken,
        mut on_delta: D,
    ) -> Result<()>
    where
        D: FnMut(&WorkflowId, &str),
    {
        let mut interrupted = false;
        loop {
            if self.is_idle() {
                while let Ok(event) = self.events_rx.try_recv() {
                    self.dispatch(event, &mut on_delta)?;
                }
                if self.is_idle() {
                    break;
                }
                continue;
            }

            tokio::select! {
                Some(event) = self.events_rx.recv() => self.dispatch(event, &mut on_delta)?,
                Some(joined) = self.tasks.join_next_with_id() => match joined {
                    Ok((id, ())) => {
                        self.task_workflows.remove(&id);
                    }
                    Err(err) => self.abandon(err)?,
                },
                _ = interrupt.cancelled(), if !interrupted => {
                    interrupted = true;
                    info!("interrupt received, cancelling workflows");
                    self.cancel_outstanding()?;
                }
            }
        }
        debug!(dropped = self.dropped_events, "executor idle");
        Ok(())
    }

    /// Fail the workflow whose agent task panicked or was aborted.
    ///
    /// Such a task never sends its completion, so the executor reports it.
    fn abandon(&mut self, err: JoinError) -> Result<()> {
        let Some(workflow_id) = self.task_workflows.remove(&err.id()) else {
            warn!(err = %err, "unknown agent task ended abnormally");
            return Ok(());
        };
        let error = if err.is_panic() {
            format!("agent task panicked: {}", panic_message(err.into_panic()))
        } else {
            "agent task aborted".to_string()
        };
        warn!(workflow_id = %workflow_id, %error, "agent task ended abnormally");

        let outstanding = self
            .state
            .workflow(&workflow_id)
            .is_some_and(|entry| !entry.status.is_terminal());
        if outstanding {
            let completion = Completion {
                success: false,
                error: Some(error),
                ..Completion::default()
            };
            self.apply(Event::new(
                workflow_id,
                Utc::now(),
                EventKind::Completed(completion),
            ))?;
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.state.all_terminal() && self.tasks.is_empty()
    }

    fn submit(&self, workflow_id: WorkflowId, kind: EventKind) {
        // The receiver lives as long as `self`, so sending cannot fail here.
        let _ = self.events_tx.send(Event::new(workflow_id, Utc::now(), kind));
    }

    fn cancel_outstanding(&mut self) -> Result<()> {
        let outstanding: Vec<WorkflowId> = self
            .state
            .workflows
            .iter()
            .filter(|(_, entry)| !entry.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for workflow_id in outstanding {
            self.apply(Event::new(workflow_id, Utc::now(), EventKind::CancelRequested))?;
        }
        Ok(())
    }

    fn dispatch<D>(&mut self, event: Event, on_delta: &mut D) -> Result<()>
    where
        D: FnMut(&WorkflowId, &str),
    {
        let delta = match &event.kind {
            EventKind::StreamDelta(text) => Some((event.workflow_id.clone(), text.clone())),
            _ => None,
        };
        if self.apply(event)? {
            if let Some((workflow_id, text)) = delta {
                on_delta(&workflow_id, &text);
            }
        }
        Ok(())
    }

    /// Reduce one event and perform its effects. Returns whether it was accepted.
    fn apply(&mut self, event: Event) -> Result<bool> {
        let workflow_id = event.workflow_id.clone();
        let event_name = event_name(&event.kind);
        let previous = self.state.workflow(&workflow_id).map(|entry| entry.status);

        let Transition {
            state,
            effects,
            dropped,
        } = reduce(&self.state, event);
        if let Some(reason) = dropped {
            self.dropped_events += 1;
            debug!(
                workflow_id = %workflow_id,
                event = event_name,
                reason = reason.as_str(),
                "dropped workflow event"
            );
            return Ok(false);
        }
        self.state = state;

        for effect in effects {
            self.perform(effect);
        }
        self.settle(&workflow_id, previous)?;
        Ok(true)
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::LaunchAgent {
                workflow_id,
                prompt,
                session,
            } => self.launch(LaunchRequest {
                workflow_id,
                prompt,
                session,
            }),
            Effect::TerminateProcess { workflow_id } => match self.running.remove(&workflow_id) {
                Some(token) => {
                    info!(workflow_id = %workflow_id, "terminating agent");
                    token.cancel();
                }
                None => debug!(workflow_id = %workflow_id, "no agent to terminate"),
            },
        }
    }

    fn launch(&mut self, request: LaunchRequest) {
        let token = CancellationToken::new();
        self.running
            .insert(request.workflow_id.clone(), token.clone());
        let launcher = Arc::clone(&self.launcher);
        let events = self.events_tx.clone();
        info!(workflow_id = %request.workflow_id, "launching agent");

        let workflow_id = request.workflow_id.clone();
        let handle = self.tasks.spawn(async move {
            let workflow_id = request.workflow_id.clone();
            let sink = DeltaSink::new(workflow_id.clone(), events.clone());
            let completion = launcher
                .run(request, sink, token)
                .await
                .unwrap_or_else(|err| Completion {
                    success: false,
                    error: Some(format!("{err:#}")),
                    ..Completion::default()
                });
            let event = Event::new(workflow_id, Utc::now(), EventKind::Completed(completion));
            if events.send(event).is_err() {
                debug!("executor gone before completion was delivered");
            }
        });
        self.task_workflows.insert(handle.id(), workflow_id);
    }

    /// Bookkeeping for a workflow that just became terminal.
    fn settle(&mut self, workflow_id: &WorkflowId, previous: Option<WorkflowStatus>) -> Result<()> {
        let Some(entry) = self.state.workflow(workflow_id) else {
            return Ok(());
        };
        let now_terminal = entry.status.is_terminal();
        if !now_terminal || previous.is_some_and(WorkflowStatus::is_terminal) {
            return Ok(());
        }
        let status = entry.status;
        let reported = entry.payload.as_data().session_id().map(str::to_string);
        self.running.remove(workflow_id);

        if let Some(branch) = self.branches.get(workflow_id) {
            if let Some(session_id) = &reported {
                self.sessions
                    .bind(branch, session_id)
                    .with_context(|| format!("record session for {branch}"))?;
            } else if status == WorkflowStatus::Succeeded {
                self.sessions
                    .touch(branch)
                    .with_context(|| format!("touch session for {branch}"))?;
            }
        }

        match status {
            WorkflowStatus::Succeeded => info!(workflow_id = %workflow_id, "workflow succeeded"),
            WorkflowStatus::Failed => {
                warn!(
                    workflow_id = %workflow_id,
                    error = entry.error.as_deref().unwrap_or("unknown"),
                    "workflow failed"
                );
            }
            _ => info!(workflow_id = %workflow_id, ?status, "workflow finished"),
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic".to_string(), |message| message.to_string()),
    }
}

fn event_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::StartRequested(_) => "start_requested",
        EventKind::StreamDelta(_) => "stream_delta",
        EventKind::Completed(_) => "completed",
        EventKind::CancelRequested => "cancel_requested",
        EventKind::Focus => "focus",
    }
}

//! Bounded execution of short-lived collaborator commands.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Output of a finished (or killed) command.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped past the output limit, stdout and stderr combined.
    pub truncated: usize,
    pub timed_out: bool,
}

impl CapturedOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Short human description of why the command did not succeed.
    pub fn failure_summary(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        match (self.status.code(), stderr.is_empty()) {
            (Some(code), true) => format!("exit code {code}"),
            (Some(code), false) => format!("exit code {code}: {stderr}"),
            (None, _) => "terminated by signal".to_string(),
        }
    }
}

/// Split a configured command line on whitespace into program and leading args.
///
/// Quoting is not supported.
pub fn command_from_line(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let mut cmd = Command::new(words.next()?);
    cmd.args(words);
    Some(cmd)
}

/// Run `cmd` to completion, killing it after `timeout`.
///
/// stdout and stderr are drained on their own threads so a chatty child
/// cannot block on a full pipe; anything past `output_limit_bytes` per stream
/// is read and discarded.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_captured(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CapturedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command timed out, killing");
            child.kill().context("kill timed out command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };

    let (stdout, stdout_dropped) = join_reader(stdout_reader).context("collect stdout")?;
    let (stderr, stderr_dropped) = join_reader(stderr_reader).context("collect stderr")?;
    let truncated = stdout_dropped + stderr_dropped;
    if truncated > 0 {
        warn!(truncated, "command output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CapturedOutput {
        status,
        stdout,
        stderr,
        truncated,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read command output")?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
}

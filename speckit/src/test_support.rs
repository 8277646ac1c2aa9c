//! Test-only builders and collaborator doubles.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::types::{IssueRecord, IssueState, PullRequestRecord, PullRequestState};
use crate::core::workflow::Completion;
use crate::io::agent::{AgentLauncher, DeltaSink, LaunchRequest};
use crate::io::tracker::{MergeMethod, NewPullRequest, StateFilter, Tracker};

/// Open issue with no labels or comments.
pub fn issue(number: u64, title: &str, body: &str) -> IssueRecord {
    IssueRecord {
        number,
        title: title.to_string(),
        body: body.to_string(),
        state: IssueState::Open,
        labels: Vec::new(),
        comments: Vec::new(),
    }
}

/// `Feature <feature>: <name>` issue.
pub fn feature_issue(number: u64, feature: u32, name: &str) -> IssueRecord {
    issue(number, &format!("Feature {feature}: {name}"), "")
}

/// `US<story>: <description>` issue linked to `parent`.
pub fn story_issue(number: u64, story: u32, description: &str, parent: u64) -> IssueRecord {
    issue(
        number,
        &format!("US{story}: {description}"),
        &format!("Story body\n\nParent: #{parent}\n"),
    )
}

pub fn closed(mut record: IssueRecord) -> IssueRecord {
    record.state = IssueState::Closed;
    record
}

#[derive(Debug, Default)]
struct TrackerState {
    issues: Vec<IssueRecord>,
    pull_requests: Vec<PullRequestRecord>,
}

/// Tracker holding issues and pull requests in memory, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    state: Mutex<TrackerState>,
}

impl InMemoryTracker {
    pub fn with_issues(issues: Vec<IssueRecord>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                issues,
                pull_requests: Vec::new(),
            }),
        }
    }

    pub fn add_pull_request(&self, pr: PullRequestRecord) {
        self.lock().pull_requests.push(pr);
    }

    pub fn issues(&self) -> Vec<IssueRecord> {
        self.lock().issues.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_number(state: &TrackerState) -> u64 {
        let issues = state.issues.iter().map(|i| i.number);
        let prs = state.pull_requests.iter().map(|p| p.number);
        issues.chain(prs).max().unwrap_or(0) + 1
    }

    fn with_issue<T>(&self, number: u64, f: impl FnOnce(&mut IssueRecord) -> T) -> Result<T> {
        let mut state = self.lock();
        let issue = state
            .issues
            .iter_mut()
            .find(|i| i.number == number)
            .ok_or_else(|| anyhow!("issue #{number} not found"))?;
        Ok(f(issue))
    }
}

impl Tracker for InMemoryTracker {
    fn list_issues(
        &self,
        state: StateFilter,
        labels: &[String],
        limit: u32,
    ) -> Result<Vec<IssueRecord>> {
        Ok(self
            .lock()
            .issues
            .iter()
            .filter(|i| match state {
                StateFilter::Open => i.state == IssueState::Open,
                StateFilter::Closed => i.state == IssueState::Closed,
                StateFilter::All => true,
            })
            .filter(|i| labels.iter().all(|l| i.labels.contains(l)))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn get_issue(&self, number: u64) -> Result<IssueRecord> {
        self.with_issue(number, |issue| issue.clone())
    }

    fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64> {
        let mut state = self.lock();
        let number = Self::next_number(&state);
        state.issues.push(IssueRecord {
            labels: labels.to_vec(),
            ..issue(number, title, body)
        });
        Ok(number)
    }

    fn update_issue_body(&self, number: u64, body: &str) -> Result<()> {
        self.with_issue(number, |issue| issue.body = body.to_string())
    }

    fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        self.with_issue(number, |issue| issue.comments.push(body.to_string()))
    }

    fn close_issue(&self, number: u64) -> Result<()> {
        self.with_issue(number, |issue| issue.state = IssueState::Closed)
    }

    fn add_label(&self, number: u64, label: &str) -> Result<()> {
        self.with_issue(number, |issue| issue.labels.push(label.to_string()))
    }

    fn create_pull_request(&self, request: &NewPullRequest) -> Result<u64> {
        let mut state = self.lock();
        let number = Self::next_number(&state);
        state.pull_requests.push(PullRequestRecord {
            number,
            title: request.title.clone(),
            body: request.body.clone(),
            head_branch: request.head.clone(),
            base_branch: request.base.clone(),
            state: PullRequestState::Open,
            linked_issues: crate::core::grammar::linked_issues(&request.body),
        });
        Ok(number)
    }

    fn get_pull_request(&self, number: u64) -> Result<PullRequestRecord> {
        self.lock()
            .pull_requests
            .iter()
            .find(|p| p.number == number)
            .cloned()
            .ok_or_else(|| anyhow!("pull request #{number} not found"))
    }

    fn merge_pull_request(&self, number: u64, _method: MergeMethod) -> Result<()> {
        let mut state = self.lock();
        let pr = state
            .pull_requests
            .iter_mut()
            .find(|p| p.number == number)
            .ok_or_else(|| anyhow!("pull request #{number} not found"))?;
        pr.state = PullRequestState::Merged;
        Ok(())
    }

    fn pr_for_branch(&self, branch: &str) -> Result<Option<PullRequestRecord>> {
        Ok(self
            .lock()
            .pull_requests
            .iter()
            .find(|p| p.head_branch == branch)
            .cloned())
    }
}

/// What a [`ScriptedLauncher`] does for one prompt.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit each delta in order, then finish with `completion`.
    Respond {
        deltas: Vec<String>,
        completion: Completion,
    },
    /// Emit `before`, wait for cancellation, then emit `late` and report success.
    ///
    /// Models a process that keeps talking after it was asked to stop.
    HangUntilCancelled { before: String, late: String },
    /// Fail to start.
    SpawnError(String),
    /// Panic inside the launcher.
    Panic(String),
}

impl Script {
    pub fn succeed(deltas: &[&str]) -> Self {
        Script::Respond {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            completion: Completion {
                success: true,
                cost_usd: Some(0.01),
                duration_secs: Some(1.0),
                session_id: None,
                error: None,
            },
        }
    }

    pub fn fail(deltas: &[&str], error: &str) -> Self {
        Script::Respond {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            completion: Completion {
                success: false,
                error: Some(error.to_string()),
                ..Completion::default()
            },
        }
    }
}

/// Launcher that replays scripts keyed by prompt and records every request.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    scripts: HashMap<String, Script>,
    fallback: Option<Script>,
    launched: Mutex<Vec<LaunchRequest>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, prompt: &str, script: Script) -> Self {
        self.scripts.insert(prompt.to_string(), script);
        self
    }

    pub fn otherwise(mut self, script: Script) -> Self {
        self.fallback = Some(script);
        self
    }

    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn run(
        &self,
        request: LaunchRequest,
        sink: DeltaSink,
        cancel: CancellationToken,
    ) -> Result<Completion> {
        let script = self
            .scripts
            .get(&request.prompt)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| anyhow!("no script for prompt '{}'", request.prompt))?;
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        match script {
            Script::Respond { deltas, completion } => {
                for delta in deltas {
                    sink.emit(delta);
                    tokio::task::yield_now().await;
                }
                Ok(completion)
            }
            Script::HangUntilCancelled { before, late } => {
                sink.emit(before);
                cancel.cancelled().await;
                sink.emit(late);
                Ok(Completion {
                    success: true,
                    ..Completion::default()
                })
            }
            Script::SpawnError(message) => Err(anyhow!(message)),
            Script::Panic(message) => panic!("{message}"),
        }
    }
}

/// Temporary project root with a `specs/` tree.
pub struct SpecsFixture {
    pub root: tempfile::TempDir,
}

impl SpecsFixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("specs")).expect("create specs dir");
        Self { root }
    }

    pub fn specs_dir(&self) -> std::path::PathBuf {
        self.root.path().join("specs")
    }

    /// Create `specs/<branch>/` with no documents.
    pub fn feature_dir(&self, branch: &str) -> std::path::PathBuf {
        let dir = self.specs_dir().join(branch);
        std::fs::create_dir_all(&dir).expect("create feature dir");
        dir
    }

    pub fn write(&self, branch: &str, file: &str, contents: &str) {
        let dir = self.feature_dir(branch);
        std::fs::write(dir.join(file), contents).expect("write feature document");
    }
}

impl Default for SpecsFixture {
    fn default() -> Self {
        Self::new()
    }
}

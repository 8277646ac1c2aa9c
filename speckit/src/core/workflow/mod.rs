//! Deterministic workflow state machine.
//!
//! [`reduce`] folds one [`Event`] into an [`AppState`] snapshot and returns the
//! next snapshot plus the [`Effect`]s the executor should perform. It never
//! blocks or reads the clock; timestamps travel on the events.
//!
//! Lifecycle per workflow:
//!
//! ```text
//! Pending -> Running -> Streaming -> Succeeded | Failed
//!               \-----------\-----> Cancelled
//! ```
//!
//! Events for unknown or terminal workflows are dropped: the snapshot is
//! returned unchanged and the transition carries a [`DropReason`].

pub mod payload;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

pub use payload::{
    PipelineStep, PipelineStepData, PromptData, WorkflowData, WorkflowKind, WorkflowPayload,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkflowId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Streaming,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Agent conversation a workflow runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub id: String,
    /// Continue an existing conversation instead of starting one with this id.
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    pub kind: WorkflowKind,
    pub session: Option<SessionBinding>,
}

/// Final report from the agent process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub success: bool,
    pub cost_usd: Option<f64>,
    pub duration_secs: Option<f64>,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    StartRequested(WorkflowRequest),
    StreamDelta(String),
    Completed(Completion),
    CancelRequested,
    /// Show this workflow's output in the view projection.
    Focus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub workflow_id: WorkflowId,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(workflow_id: impl Into<WorkflowId>, at: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            at,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    LaunchAgent {
        workflow_id: WorkflowId,
        prompt: String,
        session: Option<SessionBinding>,
    },
    TerminateProcess {
        workflow_id: WorkflowId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownWorkflow,
    Terminal,
    DuplicateStart,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::UnknownWorkflow => "unknown_workflow",
            DropReason::Terminal => "terminal",
            DropReason::DuplicateStart => "duplicate_start",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEntry {
    pub status: WorkflowStatus,
    pub payload: WorkflowPayload,
    pub session: Option<SessionBinding>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowEntry {
    /// Accumulated output, empty for kinds without a buffer.
    pub fn output(&self) -> &str {
        self.payload.as_data().output().unwrap_or_default()
    }
}

/// Derived projection of the workflow currently on display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct View {
    pub active_workflow_id: Option<WorkflowId>,
    /// Always equals the active entry's accumulated output.
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    pub workflows: BTreeMap<WorkflowId, WorkflowEntry>,
    pub view: View,
}

impl AppState {
    pub fn workflow(&self, id: &WorkflowId) -> Option<&WorkflowEntry> {
        self.workflows.get(id)
    }

    pub fn all_terminal(&self) -> bool {
        self.workflows.values().all(|entry| entry.status.is_terminal())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: AppState,
    pub effects: Vec<Effect>,
    pub dropped: Option<DropReason>,
}

impl Transition {
    fn applied(state: AppState, effects: Vec<Effect>) -> Self {
        Self {
            state,
            effects,
            dropped: None,
        }
    }

    fn dropped(state: &AppState, reason: DropReason) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
            dropped: Some(reason),
        }
    }
}

/// Apply one event to `state`.
pub fn reduce(state: &AppState, event: Event) -> Transition {
    let Event {
        workflow_id,
        at,
        kind,
    } = event;

    if let EventKind::StartRequested(request) = kind {
        return start(state, workflow_id, at, request);
    }

    let Some(entry) = state.workflows.get(&workflow_id) else {
        return Transition::dropped(state, DropReason::UnknownWorkflow);
    };

    if let EventKind::Focus = kind {
        let mut next = state.clone();
        next.view = View {
            output: entry.output().to_string(),
            active_workflow_id: Some(workflow_id),
        };
        return Transition::applied(next, Vec::new());
    }

    if entry.status.is_terminal() {
        return Transition::dropped(state, DropReason::Terminal);
    }

    let mut next = state.clone();
    let is_active = next.view.active_workflow_id.as_ref() == Some(&workflow_id);
    let Some(entry) = next.workflows.get_mut(&workflow_id) else {
        return Transition::dropped(state, DropReason::UnknownWorkflow);
    };
    entry.updated_at = at;

    let mut effects = Vec::new();
    match kind {
        EventKind::StreamDelta(delta) => {
            entry.status = WorkflowStatus::Streaming;
            if let Some(output) = entry.payload.as_data_mut().output_mut() {
                output.push_str(&delta);
                if is_active {
                    next.view.output.push_str(&delta);
                }
            }
        }
        EventKind::Completed(completion) => {
            entry.status = if completion.success {
                WorkflowStatus::Succeeded
            } else {
                WorkflowStatus::Failed
            };
            let data = entry.payload.as_data_mut();
            data.record_cost(completion.cost_usd, completion.duration_secs);
            if let Some(session_id) = &completion.session_id {
                data.record_session(session_id);
            }
            entry.error = completion.error;
        }
        EventKind::CancelRequested => {
            entry.status = WorkflowStatus::Cancelled;
            effects.push(Effect::TerminateProcess { workflow_id });
        }
        EventKind::StartRequested(_) | EventKind::Focus => {}
    }

    Transition::applied(next, effects)
}

fn start(
    state: &AppState,
    workflow_id: WorkflowId,
    at: DateTime<Utc>,
    request: WorkflowRequest,
) -> Transition {
    if state.workflows.contains_key(&workflow_id) {
        return Transition::dropped(state, DropReason::DuplicateStart);
    }

    let mut entry = WorkflowEntry {
        status: WorkflowStatus::Pending,
        payload: WorkflowPayload::from_kind(&request.kind),
        session: request.session.clone(),
        error: None,
        created_at: at,
        updated_at: at,
    };
    let launch = Effect::LaunchAgent {
        workflow_id: workflow_id.clone(),
        prompt: request.kind.prompt(),
        session: request.session,
    };
    entry.status = WorkflowStatus::Running;

    let mut next = state.clone();
    next.view = View {
        active_workflow_id: Some(workflow_id.clone()),
        output: entry.output().to_string(),
    };
    next.workflows.insert(workflow_id, entry);

    Transition::applied(next, vec![launch])
}

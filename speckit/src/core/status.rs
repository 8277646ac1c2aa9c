//! Lifecycle status derivation for features.
//!
//! A feature's status is derived from the tracker issue state plus the presence
//! and content of the feature's local documents. Derivation is a pure function of
//! [`StatusSignals`]; first matching rule wins:
//!
//! 1. closed issue -> `Complete`
//! 2. no spec directory -> `IssueCreated`
//! 3. tasks document -> `Reviewing` if every checkbox is ticked (and at least one
//!    is), else `Implementing`
//! 4. plan document -> `Planned`
//! 5. spec document -> `Clarified` with a clarifications section, else `Specified`
//! 6. otherwise -> `IssueCreated`

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::IssueState;

/// Marker whose presence in `spec.md` means clarifications were recorded.
pub const CLARIFICATIONS_MARKER: &str = "## Clarifications";

const INCOMPLETE_BOX: &str = "- [ ]";
const COMPLETE_BOX_LOWER: &str = "- [x]";
const COMPLETE_BOX_UPPER: &str = "- [X]";

/// Ordered lifecycle of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Discovered,
    IssueCreated,
    Specified,
    Clarified,
    Planned,
    Tasked,
    Implementing,
    Reviewing,
    Complete,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStatus::Discovered => "discovered",
            LifecycleStatus::IssueCreated => "issue_created",
            LifecycleStatus::Specified => "specified",
            LifecycleStatus::Clarified => "clarified",
            LifecycleStatus::Planned => "planned",
            LifecycleStatus::Tasked => "tasked",
            LifecycleStatus::Implementing => "implementing",
            LifecycleStatus::Reviewing => "reviewing",
            LifecycleStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The seven inputs status derivation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSignals {
    pub issue_state: IssueState,
    pub has_spec_dir: bool,
    pub has_spec_file: bool,
    pub spec_has_clarifications: bool,
    pub has_plan_file: bool,
    pub has_tasks_file: bool,
    pub tasks_all_complete: bool,
}

impl StatusSignals {
    /// Build signals from raw document contents (`None` = document absent).
    pub fn from_documents(
        issue_state: IssueState,
        has_spec_dir: bool,
        spec: Option<&str>,
        has_plan_file: bool,
        tasks: Option<&str>,
    ) -> Self {
        Self {
            issue_state,
            has_spec_dir,
            has_spec_file: spec.is_some(),
            spec_has_clarifications: spec.is_some_and(has_clarifications),
            has_plan_file,
            has_tasks_file: tasks.is_some(),
            tasks_all_complete: tasks.is_some_and(all_tasks_complete),
        }
    }
}

/// Derive exactly one lifecycle status from the given signals.
pub fn derive(signals: &StatusSignals) -> LifecycleStatus {
    if signals.issue_state.is_closed() {
        return LifecycleStatus::Complete;
    }
    if !signals.has_spec_dir {
        return LifecycleStatus::IssueCreated;
    }
    if signals.has_tasks_file {
        return if signals.tasks_all_complete {
            LifecycleStatus::Reviewing
        } else {
            LifecycleStatus::Implementing
        };
    }
    if signals.has_plan_file {
        return LifecycleStatus::Planned;
    }
    if signals.has_spec_file {
        return if signals.spec_has_clarifications {
            LifecycleStatus::Clarified
        } else {
            LifecycleStatus::Specified
        };
    }
    LifecycleStatus::IssueCreated
}

/// True if `spec` contains the clarifications section marker.
pub fn has_clarifications(spec: &str) -> bool {
    spec.contains(CLARIFICATIONS_MARKER)
}

/// True when no checkbox is open and at least one is ticked.
///
/// A document without any checkbox is not complete.
pub fn all_tasks_complete(tasks: &str) -> bool {
    let incomplete = tasks.matches(INCOMPLETE_BOX).count();
    let complete =
        tasks.matches(COMPLETE_BOX_LOWER).count() + tasks.matches(COMPLETE_BOX_UPPER).count();
    incomplete == 0 && complete > 0
}

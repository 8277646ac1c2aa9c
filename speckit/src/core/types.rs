//! Shared value types for tracker records and derived work items.
//!
//! Records are produced by the tracker collaborator; work items are derived from
//! records plus local documents. None of these types perform I/O.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::status::LifecycleStatus;

/// Open/closed state of a tracker issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    /// Parse a tracker state string (`OPEN`, `closed`, ...). Unknown values are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Some(IssueState::Open),
            "closed" => Some(IssueState::Closed),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        self == IssueState::Closed
    }
}

/// Flat issue record as returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    Open,
    Merged,
    Closed,
}

impl PullRequestState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Some(PullRequestState::Open),
            "merged" => Some(PullRequestState::Merged),
            "closed" => Some(PullRequestState::Closed),
            _ => None,
        }
    }
}

/// Flat pull request record as returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
    pub state: PullRequestState,
    /// Issues referenced by `closes|fixes|resolves #N` in the body.
    #[serde(default)]
    pub linked_issues: Vec<u64>,
}

/// A task line parsed from a tasks document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task code, e.g. `T001`.
    pub id: String,
    pub description: String,
    /// Best-effort target path pulled from a trailing `in <path>` suffix.
    pub file_path: Option<String>,
    pub is_parallel: bool,
    /// Owning story code, e.g. `US1`.
    pub user_story: Option<String>,
    pub completed: bool,
}

/// A user story owned by a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStory {
    /// Story code, e.g. `US1`. Unique within the parent feature.
    pub id: String,
    /// Full title of the story issue.
    pub description: String,
    /// Priority tier. Always `P1` until story bodies carry a priority.
    pub priority: String,
    pub issue_number: Option<u64>,
    /// `pending`, `in_progress` or `complete`.
    pub status: String,
    pub tasks: Vec<Task>,
}

/// A tracked feature, derived from one tracker issue plus local documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub number: u32,
    pub name: String,
    pub description: String,
    pub issue_number: Option<u64>,
    /// `{number:03}-{slug(name)}`.
    pub branch: String,
    pub spec_dir: PathBuf,
    pub status: LifecycleStatus,
    /// Copy of the session id held by the session store.
    pub session_id: String,
    pub user_stories: Vec<UserStory>,
    pub pr_number: Option<u64>,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.branch, self.status)?;
        if let Some(issue) = self.issue_number {
            write!(f, " #{issue}")?;
        }
        Ok(())
    }
}

//! Issue tracker collaborator.
//!
//! [`Tracker`] is the seam between feature orchestration and the external
//! issue/PR system. [`GhTracker`] drives the `gh` CLI with `--json` output;
//! tests substitute an in-memory tracker.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::core::grammar;
use crate::core::types::{IssueRecord, IssueState, PullRequestRecord, PullRequestState};
use crate::error::SpeckitError;
use crate::io::config::SpeckitConfig;
use crate::io::process::{CapturedOutput, command_from_line, run_captured};

const COLLABORATOR: &str = "tracker";

const ISSUE_LIST_FIELDS: &str = "number,title,body,state,labels";
const ISSUE_VIEW_FIELDS: &str = "number,title,body,state,labels,comments";
const PR_FIELDS: &str = "number,title,body,headRefName,baseRefName,state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    Open,
    Closed,
    All,
}

impl StateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            StateFilter::Open => "open",
            StateFilter::Closed => "closed",
            StateFilter::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    fn flag(self) -> &'static str {
        match self {
            MergeMethod::Merge => "--merge",
            MergeMethod::Squash => "--squash",
            MergeMethod::Rebase => "--rebase",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

/// Operations the feature layer needs from the issue tracker.
pub trait Tracker {
    fn list_issues(
        &self,
        state: StateFilter,
        labels: &[String],
        limit: u32,
    ) -> Result<Vec<IssueRecord>>;

    /// Single issue including comment bodies.
    fn get_issue(&self, number: u64) -> Result<IssueRecord>;

    /// Returns the new issue number.
    fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64>;

    fn update_issue_body(&self, number: u64, body: &str) -> Result<()>;

    fn add_comment(&self, number: u64, body: &str) -> Result<()>;

    fn close_issue(&self, number: u64) -> Result<()>;

    fn add_label(&self, number: u64, label: &str) -> Result<()>;

    /// Returns the new pull request number.
    fn create_pull_request(&self, request: &NewPullRequest) -> Result<u64>;

    fn get_pull_request(&self, number: u64) -> Result<PullRequestRecord>;

    fn merge_pull_request(&self, number: u64, method: MergeMethod) -> Result<()>;

    /// First pull request whose head is `branch`. Lookup failures read as `None`.
    fn pr_for_branch(&self, branch: &str) -> Result<Option<PullRequestRecord>>;
}

/// Tracker backed by the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhTracker {
    command_line: String,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl GhTracker {
    /// Build a tracker and check that the CLI is installed and authenticated.
    pub fn connect(cfg: &SpeckitConfig, workdir: &Path) -> Result<Self> {
        let tracker = Self {
            command_line: cfg.tracker_command.clone(),
            workdir: workdir.to_path_buf(),
            timeout: cfg.tracker_timeout(),
            output_limit_bytes: cfg.tracker_output_limit_bytes,
        };
        tracker.verify_auth()?;
        Ok(tracker)
    }

    fn verify_auth(&self) -> Result<()> {
        let output = self.capture(&["auth", "status"]).map_err(|err| {
            SpeckitError::collaborator(COLLABORATOR, format!("cli not installed: {err:#}"))
        })?;
        if !output.succeeded() {
            return Err(SpeckitError::collaborator(
                COLLABORATOR,
                format!("cli not authenticated: {}", output.failure_summary()),
            )
            .into());
        }
        debug!("tracker cli authenticated");
        Ok(())
    }

    fn command(&self, args: &[&str]) -> Result<Command> {
        let mut cmd = command_from_line(&self.command_line).ok_or_else(|| {
            SpeckitError::collaborator(COLLABORATOR, "tracker_command is empty")
        })?;
        cmd.args(args).current_dir(&self.workdir);
        Ok(cmd)
    }

    fn capture(&self, args: &[&str]) -> Result<CapturedOutput> {
        run_captured(self.command(args)?, self.timeout, self.output_limit_bytes)
    }

    /// Run and require success; stdout as text.
    #[instrument(skip_all, fields(op = ?args.first()))]
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self
            .capture(args)
            .map_err(|err| SpeckitError::collaborator(COLLABORATOR, format!("{err:#}")))?;
        if !output.succeeded() {
            return Err(SpeckitError::collaborator(
                COLLABORATOR,
                format!("`{}` failed: {}", args.join(" "), output.failure_summary()),
            )
            .into());
        }
        Ok(output.stdout_text())
    }

    fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout).map_err(|err| {
            SpeckitError::collaborator(
                COLLABORATOR,
                format!("unparsable output from `{}`: {err}", args.join(" ")),
            )
            .into()
        })
    }
}

impl Tracker for GhTracker {
    fn list_issues(
        &self,
        state: StateFilter,
        labels: &[String],
        limit: u32,
    ) -> Result<Vec<IssueRecord>> {
        let limit = limit.to_string();
        let joined = labels.join(",");
        let mut args = vec![
            "issue",
            "list",
            "--state",
            state.as_str(),
            "--limit",
            limit.as_str(),
            "--json",
            ISSUE_LIST_FIELDS,
        ];
        if !labels.is_empty() {
            args.extend(["--label", joined.as_str()]);
        }
        let raw: Vec<GhIssue> = self.run_json(&args)?;
        let issues = raw
            .into_iter()
            .map(GhIssue::into_record)
            .collect::<Result<Vec<_>>>()?;
        debug!(count = issues.len(), "listed issues");
        Ok(issues)
    }

    fn get_issue(&self, number: u64) -> Result<IssueRecord> {
        let number = number.to_string();
        let raw: GhIssue =
            self.run_json(&["issue", "view", &number, "--json", ISSUE_VIEW_FIELDS])?;
        raw.into_record()
    }

    fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64> {
        let mut args = vec!["issue", "create", "--title", title, "--body", body];
        for label in labels {
            args.extend(["--label", label.as_str()]);
        }
        let stdout = self.run(&args)?;
        let number = grammar::issue_number_from_url(&stdout).ok_or_else(|| {
            SpeckitError::collaborator(
                COLLABORATOR,
                format!("could not parse issue number from: {}", stdout.trim()),
            )
        })?;
        info!(number, title, "created issue");
        Ok(number)
    }

    fn update_issue_body(&self, number: u64, body: &str) -> Result<()> {
        self.run(&["issue", "edit", &number.to_string(), "--body", body])
            .map(drop)
    }

    fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        self.run(&["issue", "comment", &number.to_string(), "--body", body])
            .map(drop)
    }

    fn close_issue(&self, number: u64) -> Result<()> {
        self.run(&["issue", "close", &number.to_string()]).map(drop)
    }

    fn add_label(&self, number: u64, label: &str) -> Result<()> {
        self.run(&["issue", "edit", &number.to_string(), "--add-label", label])
            .map(drop)
    }

    fn create_pull_request(&self, request: &NewPullRequest) -> Result<u64> {
        let stdout = self.run(&[
            "pr",
            "create",
            "--title",
            &request.title,
            "--body",
            &request.body,
            "--head",
            &request.head,
            "--base",
            &request.base,
        ])?;
        let number = grammar::pull_number_from_url(&stdout).ok_or_else(|| {
            SpeckitError::collaborator(
                COLLABORATOR,
                format!("could not parse pull request number from: {}", stdout.trim()),
            )
        })?;
        info!(number, head = %request.head, "created pull request");
        Ok(number)
    }

    fn get_pull_request(&self, number: u64) -> Result<PullRequestRecord> {
        let number = number.to_string();
        let raw: GhPullRequest = self.run_json(&["pr", "view", &number, "--json", PR_FIELDS])?;
        raw.into_record()
    }

    fn merge_pull_request(&self, number: u64, method: MergeMethod) -> Result<()> {
        self.run(&["pr", "merge", &number.to_string(), method.flag()])
            .map(drop)
    }

    fn pr_for_branch(&self, branch: &str) -> Result<Option<PullRequestRecord>> {
        let args = [
            "pr", "list", "--head", branch, "--json", PR_FIELDS, "--limit", "1",
        ];
        let output = match self.capture(&args) {
            Ok(output) if output.succeeded() => output,
            Ok(output) => {
                warn!(branch, reason = %output.failure_summary(), "pull request lookup failed");
                return Ok(None);
            }
            Err(err) => {
                warn!(branch, err = %format!("{err:#}"), "pull request lookup failed");
                return Ok(None);
            }
        };
        let prs: Vec<GhPullRequest> = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parse pull request list for {branch}"))?;
        prs.into_iter().next().map(GhPullRequest::into_record).transpose()
    }
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    comments: Vec<GhComment>,
}

impl GhIssue {
    fn into_record(self) -> Result<IssueRecord> {
        let state = IssueState::parse(&self.state).ok_or_else(|| {
            SpeckitError::collaborator(
                COLLABORATOR,
                format!("issue #{} has unknown state '{}'", self.number, self.state),
            )
        })?;
        Ok(IssueRecord {
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            state,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            comments: self.comments.into_iter().map(|c| c.body).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    head_ref_name: String,
    base_ref_name: String,
    state: String,
}

impl GhPullRequest {
    fn into_record(self) -> Result<PullRequestRecord> {
        let state = PullRequestState::parse(&self.state).ok_or_else(|| {
            SpeckitError::collaborator(
                COLLABORATOR,
                format!("pull request #{} has unknown state '{}'", self.number, self.state),
            )
        })?;
        let body = self.body.unwrap_or_default();
        Ok(PullRequestRecord {
            number: self.number,
            title: self.title,
            linked_issues: grammar::linked_issues(&body),
            body,
            head_branch: self.head_ref_name,
            base_branch: self.base_ref_name,
            state,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use super::*;

    /// Fake `gh` that answers from a fixed script and logs its argv.
    const FAKE_GH: &str = r#"
echo "$@" >> "$(dirname "$0")/calls.log"
case "$1 $2" in
  "auth status") exit 0 ;;
  "issue list")
    echo '[{"number":7,"title":"Feature 1: Login","body":null,"state":"OPEN","labels":[{"name":"feature"}]},
           {"number":8,"title":"US1: Sign in","body":"Parent: #7","state":"CLOSED","labels":[]}]' ;;
  "issue view")
    echo '{"number":7,"title":"Feature 1: Login","body":"b","state":"OPEN","labels":[],"comments":[{"body":"hi"}]}' ;;
  "issue create") echo "https://github.com/o/r/issues/42" ;;
  "issue comment") exit 0 ;;
  "pr view")
    echo '{"number":3,"title":"t","body":"Closes #7 and fixes #8","headRefName":"001-login","baseRefName":"main","state":"MERGED"}' ;;
  "pr list") echo "no such head" >&2; exit 1 ;;
  *) echo "unexpected: $*" >&2; exit 1 ;;
esac
"#;

    /// Fake `gh` that accepts every write and logs its argv.
    const WRITABLE_GH: &str = r#"
echo "$@" >> "$(dirname "$0")/calls.log"
case "$1 $2" in
  "pr create") echo "https://github.com/o/r/pull/5" ;;
  *) exit 0 ;;
esac
"#;

    const UNAUTHENTICATED_GH: &str = "echo 'You are not logged in' >&2\nexit 1\n";

    fn fake_tracker(script: &str) -> (tempfile::TempDir, Result<GhTracker>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let script_path = temp.path().join("gh.sh");
        fs::write(&script_path, script).expect("write script");
        let cfg = SpeckitConfig {
            tracker_command: format!("sh {}", script_path.display()),
            tracker_timeout_secs: 10,
            ..SpeckitConfig::default()
        };
        let tracker = GhTracker::connect(&cfg, temp.path());
        (temp, tracker)
    }

    fn calls(temp: &tempfile::TempDir) -> String {
        fs::read_to_string(temp.path().join("calls.log")).expect("calls log")
    }

    #[test]
    fn lists_issues_with_states_and_labels() {
        let (temp, tracker) = fake_tracker(FAKE_GH);
        let tracker = tracker.expect("connect");
        let issues = tracker
            .list_issues(StateFilter::All, &["feature".to_string()], 50)
            .expect("list");

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].body, "");
        assert_eq!(issues[0].labels, vec!["feature"]);
        assert_eq!(issues[1].state, IssueState::Closed);
        assert!(calls(&temp).contains(
            "issue list --state all --limit 50 --json number,title,body,state,labels --label feature"
        ));
    }

    #[test]
    fn get_issue_includes_comments() {
        let (_temp, tracker) = fake_tracker(FAKE_GH);
        let issue = tracker.expect("connect").get_issue(7).expect("view");
        assert_eq!(issue.comments, vec!["hi"]);
    }

    #[test]
    fn create_issue_parses_number_from_url() {
        let (temp, tracker) = fake_tracker(FAKE_GH);
        let number = tracker
            .expect("connect")
            .create_issue("US2: Logout", "Parent: #7", &["story".to_string()])
            .expect("create");
        assert_eq!(number, 42);
        assert!(calls(&temp).contains("--label story"));
    }

    #[test]
    fn pull_request_links_issues() {
        let (_temp, tracker) = fake_tracker(FAKE_GH);
        let pr = tracker.expect("connect").get_pull_request(3).expect("view");
        assert_eq!(pr.state, PullRequestState::Merged);
        assert_eq!(pr.head_branch, "001-login");
        assert_eq!(pr.linked_issues, vec![7, 8]);
    }

    #[test]
    fn pr_for_branch_is_lenient() {
        let (_temp, tracker) = fake_tracker(FAKE_GH);
        let pr = tracker.expect("connect").pr_for_branch("001-login").expect("lookup");
        assert_eq!(pr, None);
    }

    #[test]
    fn issue_mutations_pass_their_arguments() {
        let (temp, tracker) = fake_tracker(WRITABLE_GH);
        let tracker = tracker.expect("connect");
        tracker.update_issue_body(7, "new body").expect("edit");
        tracker.add_label(7, "in-progress").expect("label");
        tracker.close_issue(8).expect("close");

        let log = calls(&temp);
        let lines: Vec<&str> = log.lines().filter(|line| line.starts_with("issue")).collect();
        assert_eq!(
            lines,
            vec![
                "issue edit 7 --body new body",
                "issue edit 7 --add-label in-progress",
                "issue close 8",
            ]
        );
    }

    #[test]
    fn pull_request_create_and_merge() {
        let (temp, tracker) = fake_tracker(WRITABLE_GH);
        let tracker = tracker.expect("connect");
        let number = tracker
            .create_pull_request(&NewPullRequest {
                title: "Login".to_string(),
                body: "Closes #7".to_string(),
                head: "001-login".to_string(),
                base: "main".to_string(),
            })
            .expect("create");
        assert_eq!(number, 5);
        tracker
            .merge_pull_request(number, MergeMethod::Squash)
            .expect("merge");

        let log = calls(&temp);
        let lines: Vec<&str> = log.lines().filter(|line| line.starts_with("pr")).collect();
        assert_eq!(
            lines,
            vec![
                "pr create --title Login --body Closes #7 --head 001-login --base main",
                "pr merge 5 --squash",
            ]
        );
    }

    #[test]
    fn get_pull_request_requests_its_fields() {
        let (temp, tracker) = fake_tracker(FAKE_GH);
        tracker.expect("connect").get_pull_request(3).expect("view");
        assert!(calls(&temp).contains(&format!("pr view 3 --json {PR_FIELDS}")));
    }

    #[test]
    fn failing_command_is_collaborator_error() {
        let (_temp, tracker) = fake_tracker(FAKE_GH);
        let err = tracker.expect("connect").close_issue(7).expect_err("unexpected");
        let typed = err.downcast_ref::<SpeckitError>().expect("typed");
        assert!(matches!(typed, SpeckitError::Collaborator { .. }));
        assert!(err.to_string().contains("issue close 7"));
    }

    #[test]
    fn connect_requires_authentication() {
        let (_temp, tracker) = fake_tracker(UNAUTHENTICATED_GH);
        let err = tracker.expect_err("unauthenticated");
        assert!(err.to_string().contains("not authenticated"));
    }

    #[test]
    fn connect_reports_missing_cli() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = SpeckitConfig {
            tracker_command: temp.path().join("no-such-gh").display().to_string(),
            ..SpeckitConfig::default()
        };
        let err = GhTracker::connect(&cfg, temp.path()).expect_err("missing");
        assert!(err.to_string().contains("not installed"));
    }
}

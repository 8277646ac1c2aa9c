//! Read-only access to a feature's local documents.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::status::StatusSignals;
use crate::core::types::IssueState;

pub const SPEC_FILE: &str = "spec.md";
pub const PLAN_FILE: &str = "plan.md";
pub const TASKS_FILE: &str = "tasks.md";

/// Snapshot of `<specs_dir>/<branch>/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureDocs {
    pub dir: PathBuf,
    pub dir_exists: bool,
    pub spec: Option<String>,
    pub has_plan: bool,
    pub tasks: Option<String>,
}

impl FeatureDocs {
    pub fn read(specs_dir: &Path, branch: &str) -> Result<Self> {
        let dir = specs_dir.join(branch);
        if !dir.is_dir() {
            return Ok(Self {
                dir,
                ..Self::default()
            });
        }
        Ok(Self {
            spec: read_optional(&dir.join(SPEC_FILE))?,
            has_plan: dir.join(PLAN_FILE).is_file(),
            tasks: read_optional(&dir.join(TASKS_FILE))?,
            dir_exists: true,
            dir,
        })
    }

    pub fn signals(&self, issue_state: IssueState) -> StatusSignals {
        StatusSignals::from_documents(
            issue_state,
            self.dir_exists,
            self.spec.as_deref(),
            self.has_plan,
            self.tasks.as_deref(),
        )
    }
}

/// File contents, or `None` if the file does not exist.
///
/// Invalid UTF-8 is replaced, not rejected. Only ASCII markers are read from
/// these documents.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::{LifecycleStatus, derive};

    #[test]
    fn missing_dir_reads_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let docs = FeatureDocs::read(temp.path(), "001-a").expect("read");
        assert!(!docs.dir_exists);
        assert_eq!(
            derive(&docs.signals(IssueState::Open)),
            LifecycleStatus::IssueCreated
        );
    }

    #[test]
    fn reads_present_documents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("001-a");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(SPEC_FILE), "# Spec\n").expect("write spec");
        fs::write(dir.join(PLAN_FILE), "# Plan\n").expect("write plan");

        let docs = FeatureDocs::read(temp.path(), "001-a").expect("read");
        assert!(docs.dir_exists);
        assert_eq!(docs.spec.as_deref(), Some("# Spec\n"));
        assert!(docs.has_plan);
        assert_eq!(docs.tasks, None);
        assert_eq!(derive(&docs.signals(IssueState::Open)), LifecycleStatus::Planned);
        assert_eq!(
            derive(&docs.signals(IssueState::Closed)),
            LifecycleStatus::Complete
        );
    }

    #[test]
    fn invalid_utf8_still_yields_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("002-b");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(SPEC_FILE), b"# Spec \xff\n## Clarifications\n").expect("write spec");
        fs::write(dir.join(TASKS_FILE), b"- [x] T001 caf\xe9\n- [X] T002 done\n")
            .expect("write tasks");

        let docs = FeatureDocs::read(temp.path(), "002-b").expect("read");
        let signals = docs.signals(IssueState::Open);
        assert!(signals.spec_has_clarifications);
        assert!(signals.tasks_all_complete);
        assert_eq!(derive(&signals), LifecycleStatus::Reviewing);
    }
}

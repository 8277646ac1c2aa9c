//! Feature graph orchestration for `speckit features`, `feature` and `tasks`.
//!
//! Combines the pure correlation in [`crate::core::graph`] with the tracker,
//! the local spec tree, and the session store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::graph::{self, FeatureDraft};
use crate::core::status::{LifecycleStatus, derive};
use crate::core::tasks::parse_tasks;
use crate::core::types::{Feature, IssueRecord, Task};
use crate::io::documents::{FeatureDocs, TASKS_FILE, read_optional};
use crate::io::session_store::SessionStore;
use crate::io::tracker::{StateFilter, Tracker};

pub struct FeatureTracker<'a> {
    tracker: &'a dyn Tracker,
    sessions: &'a SessionStore,
    specs_dir: PathBuf,
    list_limit: u32,
}

impl<'a> FeatureTracker<'a> {
    pub fn new(
        tracker: &'a dyn Tracker,
        sessions: &'a SessionStore,
        specs_dir: impl Into<PathBuf>,
        list_limit: u32,
    ) -> Self {
        Self {
            tracker,
            sessions,
            specs_dir: specs_dir.into(),
            list_limit,
        }
    }

    pub fn specs_dir(&self) -> &Path {
        &self.specs_dir
    }

    /// Fetch every issue and build the feature list, sorted by number.
    #[instrument(skip(self))]
    pub fn build_features(&self) -> Result<Vec<Feature>> {
        let issues = self
            .tracker
            .list_issues(StateFilter::All, &[], self.list_limit)
            .context("list tracker issues")?;
        self.discover(&issues)
    }

    /// Build features from already fetched records.
    ///
    /// Records with a feature-shaped title but an unusable number are left out.
    pub fn discover(&self, issues: &[IssueRecord]) -> Result<Vec<Feature>> {
        let correlation = graph::correlate(issues);
        for number in &correlation.skipped {
            debug!(issue = number, "skipping feature issue with unparsable number");
        }
        let features = correlation
            .features
            .into_iter()
            .map(|draft| self.resolve(draft))
            .collect::<Result<Vec<_>>>()?;
        debug!(count = features.len(), "discovered features");
        Ok(features)
    }

    pub fn feature_by_number(&self, number: u32) -> Result<Option<Feature>> {
        Ok(self
            .build_features()?
            .into_iter()
            .find(|feature| feature.number == number))
    }

    /// Features whose status is anything but `Complete`.
    pub fn open_features(&self) -> Result<Vec<Feature>> {
        Ok(self
            .build_features()?
            .into_iter()
            .filter(|feature| feature.status != LifecycleStatus::Complete)
            .collect())
    }

    /// Parse the feature's tasks document and attach tasks to its stories.
    ///
    /// Returns every parsed task, including ones not tagged with a story.
    pub fn tasks_for(&self, feature: &mut Feature) -> Result<Vec<Task>> {
        let path = feature.spec_dir.join(TASKS_FILE);
        let tasks = read_optional(&path)?
            .map(|document| parse_tasks(&document))
            .unwrap_or_default();
        graph::attach_tasks(&mut feature.user_stories, &tasks);
        Ok(tasks)
    }

    /// Fill `pr_number` from the tracker's pull request for the feature branch.
    pub fn attach_pull_request(&self, feature: &mut Feature) -> Result<()> {
        feature.pr_number = self
            .tracker
            .pr_for_branch(&feature.branch)?
            .map(|pr| pr.number);
        Ok(())
    }

    fn resolve(&self, draft: FeatureDraft) -> Result<Feature> {
        let docs = FeatureDocs::read(&self.specs_dir, &draft.branch)
            .with_context(|| format!("read documents for {}", draft.branch))?;
        let status = derive(&docs.signals(draft.issue_state));
        let session_id = self
            .sessions
            .get_or_create(&draft.branch)
            .with_context(|| format!("session for {}", draft.branch))?;
        Ok(Feature {
            number: draft.number,
            name: draft.name,
            description: draft.description,
            issue_number: Some(draft.issue_number),
            spec_dir: docs.dir,
            status,
            session_id,
            user_stories: draft.stories,
            pr_number: None,
            branch: draft.branch,
        })
    }
}

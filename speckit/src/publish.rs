//! `speckit publish`: create story sub-issues from a feature's spec.

use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::tasks::{parse_user_story_ids, user_story_title};
use crate::features::FeatureTracker;
use crate::io::documents::{SPEC_FILE, read_optional};
use crate::io::tracker::Tracker;

const STORY_ISSUE_TEMPLATE: &str = include_str!("templates/story_issue.md");
const STORY_SUMMARY_TEMPLATE: &str = include_str!("templates/story_summary.md");

pub const STORY_LABEL: &str = "user-story";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedStory {
    pub id: String,
    pub title: String,
    pub issue_number: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub created: Vec<PublishedStory>,
    /// Story codes that already had a sub-issue.
    pub existing: Vec<String>,
}

/// Create one sub-issue per story in `spec.md` that has none yet, then
/// comment on the feature issue with the list of created stories.
#[instrument(skip(features, tracker))]
pub fn publish_stories(
    features: &FeatureTracker<'_>,
    tracker: &dyn Tracker,
    feature_number: u32,
) -> Result<PublishOutcome> {
    let feature = features
        .feature_by_number(feature_number)?
        .ok_or_else(|| anyhow!("feature {feature_number} not found"))?;
    let feature_issue = feature
        .issue_number
        .with_context(|| format!("feature {feature_number} has no tracker issue"))?;
    let spec_path = feature.spec_dir.join(SPEC_FILE);
    let spec = read_optional(&spec_path)?
        .with_context(|| format!("{} does not exist", spec_path.display()))?;

    let known: BTreeSet<&str> = feature
        .user_stories
        .iter()
        .map(|story| story.id.as_str())
        .collect();
    let mut story_ids: Vec<String> = parse_user_story_ids(&spec).into_iter().collect();
    story_ids.sort_by_key(|id| story_number(id));

    let env = templates()?;
    let issue_template = env.get_template("story_issue")?;
    let labels = [STORY_LABEL.to_string()];
    let mut outcome = PublishOutcome::default();

    for id in story_ids {
        if known.contains(id.as_str()) {
            outcome.existing.push(id);
            continue;
        }
        let title = user_story_title(&spec, &id).unwrap_or_else(|| id.clone());
        let body = issue_template.render(context! {
            story_id => &id,
            title => &title,
            feature_issue => feature_issue,
            feature_branch => &feature.branch,
            spec_path => spec_path.display().to_string(),
        })?;
        let issue_number = tracker
            .create_issue(&format!("{id}: {title}"), &body, &labels)
            .with_context(|| format!("create issue for {id}"))?;
        info!(story = %id, issue_number, "published user story");
        outcome.created.push(PublishedStory {
            id,
            title,
            issue_number,
        });
    }

    if !outcome.created.is_empty() {
        let summary = env.get_template("story_summary")?.render(context! {
            feature_branch => &feature.branch,
            stories => &outcome.created,
        })?;
        tracker
            .add_comment(feature_issue, &summary)
            .with_context(|| format!("comment on feature issue #{feature_issue}"))?;
    }

    Ok(outcome)
}

fn templates() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("story_issue", STORY_ISSUE_TEMPLATE)?;
    env.add_template("story_summary", STORY_SUMMARY_TEMPLATE)?;
    Ok(env)
}

fn story_number(id: &str) -> u64 {
    id.trim_start_matches("US").parse().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grammar;
    use crate::io::session_store::{MemoryPersistence, SessionStore};
    use crate::test_support::{InMemoryTracker, SpecsFixture, feature_issue, story_issue};

    const SPEC: &str = "\
# Login

## US1: Sign in
## US2: Sign out
## US10: Remember me
";

    #[test]
    fn creates_missing_story_issues_linked_to_parent() {
        let fixture = SpecsFixture::new();
        fixture.write("001-login", "spec.md", SPEC);
        let tracker = InMemoryTracker::with_issues(vec![
            feature_issue(10, 1, "Login"),
            story_issue(11, 1, "Sign in", 10),
        ]);
        let sessions = SessionStore::open(MemoryPersistence::default()).expect("store");
        let features = FeatureTracker::new(&tracker, &sessions, fixture.specs_dir(), 100);

        let outcome = publish_stories(&features, &tracker, 1).expect("publish");
        assert_eq!(outcome.existing, vec!["US1"]);
        let created: Vec<&str> = outcome.created.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(created, vec!["US2", "US10"]);

        let issues = tracker.issues();
        let story = issues
            .iter()
            .find(|i| i.number == outcome.created[0].issue_number)
            .expect("created issue");
        assert_eq!(story.title, "US2: Sign out");
        assert_eq!(grammar::parent_ref(&story.body), Some(10));
        assert_eq!(story.labels, vec![STORY_LABEL]);

        let feature = issues.iter().find(|i| i.number == 10).expect("feature");
        assert_eq!(feature.comments.len(), 1);
        assert!(feature.comments[0].contains("US10: Remember me"));

        let rebuilt = features.feature_by_number(1).expect("rebuild").expect("found");
        assert_eq!(rebuilt.user_stories.len(), 3);
    }

    #[test]
    fn nothing_new_means_no_comment() {
        let fixture = SpecsFixture::new();
        fixture.write("001-login", "spec.md", "## US1: Sign in\n");
        let tracker = InMemoryTracker::with_issues(vec![
            feature_issue(10, 1, "Login"),
            story_issue(11, 1, "Sign in", 10),
        ]);
        let sessions = SessionStore::open(MemoryPersistence::default()).expect("store");
        let features = FeatureTracker::new(&tracker, &sessions, fixture.specs_dir(), 100);

        let outcome = publish_stories(&features, &tracker, 1).expect("publish");
        assert!(outcome.created.is_empty());
        assert!(tracker.get_issue(10).expect("feature").comments.is_empty());
    }

    #[test]
    fn missing_spec_is_an_error() {
        let fixture = SpecsFixture::new();
        let tracker = InMemoryTracker::with_issues(vec![feature_issue(10, 1, "Login")]);
        let sessions = SessionStore::open(MemoryPersistence::default()).expect("store");
        let features = FeatureTracker::new(&tracker, &sessions, fixture.specs_dir(), 100);

        let err = publish_stories(&features, &tracker, 1).expect_err("no spec");
        assert!(err.to_string().contains("spec.md"));
        let err = publish_stories(&features, &tracker, 9).expect_err("no feature");
        assert!(err.to_string().contains("feature 9 not found"));
    }
}

//! Correlation of tracker records into feature/story drafts.
//!
//! This is the pure half of the feature graph: it decides which records are
//! features, which are stories, and how they link. Status and session
//! resolution happen in [`crate::features`].

use crate::core::grammar::{self, Parsed};
use crate::core::slug::branch_name;
use crate::core::types::{IssueRecord, IssueState, Task, UserStory};

const DEFAULT_PRIORITY: &str = "P1";

pub const STORY_PENDING: &str = "pending";
pub const STORY_IN_PROGRESS: &str = "in_progress";
pub const STORY_COMPLETE: &str = "complete";

/// A feature issue with its linked stories, before status/session resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureDraft {
    pub number: u32,
    pub name: String,
    /// Feature issue body.
    pub description: String,
    pub issue_number: u64,
    pub issue_state: IssueState,
    pub branch: String,
    pub stories: Vec<UserStory>,
}

/// Drafts plus the feature-shaped records that were excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    /// Sorted by feature number ascending.
    pub features: Vec<FeatureDraft>,
    /// Issue numbers whose title looked like a feature but whose number did not parse.
    pub skipped: Vec<u64>,
}

/// Correlate feature issues with their story sub-issues.
///
/// Stories keep the order the tracker returned them in.
pub fn correlate(issues: &[IssueRecord]) -> Correlation {
    let mut correlation = Correlation::default();

    for issue in issues {
        let title = match grammar::parse_feature_title(&issue.title) {
            Parsed::Match(title) => title,
            Parsed::Mismatch => {
                if grammar::looks_like_feature(&issue.title) {
                    correlation.skipped.push(issue.number);
                }
                continue;
            }
        };

        correlation.features.push(FeatureDraft {
            branch: branch_name(title.number, &title.name),
            number: title.number,
            name: title.name,
            description: issue.body.clone(),
            issue_number: issue.number,
            issue_state: issue.state,
            stories: stories_for(issues, issue.number),
        });
    }

    correlation.features.sort_by_key(|draft| draft.number);
    correlation
}

fn stories_for(issues: &[IssueRecord], parent: u64) -> Vec<UserStory> {
    issues
        .iter()
        .filter_map(|issue| {
            let story = grammar::parse_story(&issue.title, &issue.body).ok()?;
            (story.parent_issue == parent).then(|| UserStory {
                id: story.id,
                description: issue.title.clone(),
                priority: DEFAULT_PRIORITY.to_string(),
                issue_number: Some(issue.number),
                status: STORY_PENDING.to_string(),
                tasks: Vec::new(),
            })
        })
        .collect()
}

/// Replace each story's tasks with the ones tagged for it and derive its status.
pub fn attach_tasks(stories: &mut [UserStory], tasks: &[Task]) {
    for story in stories.iter_mut() {
        story.tasks = tasks
            .iter()
            .filter(|task| task.user_story.as_deref() == Some(story.id.as_str()))
            .cloned()
            .collect();
        story.status = story_status(&story.tasks).to_string();
    }
}

fn story_status(tasks: &[Task]) -> &'static str {
    let done = tasks.iter().filter(|task| task.completed).count();
    if done == 0 {
        STORY_PENDING
    } else if done == tasks.len() {
        STORY_COMPLETE
    } else {
        STORY_IN_PROGRESS
    }
}

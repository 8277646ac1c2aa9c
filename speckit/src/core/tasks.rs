//! Parsers for tasks and spec documents.

use std::collections::BTreeSet;

use crate::core::grammar::Pattern;
use crate::core::types::Task;

/// Parse every task line in a tasks document, in document order.
///
/// Re-parsing always yields a fresh set; tasks are never patched in place.
pub fn parse_tasks(document: &str) -> Vec<Task> {
    Pattern::TaskLine
        .regex()
        .captures_iter(document)
        .map(|caps| {
            let description = caps[5].trim().to_string();
            Task {
                id: caps[2].to_string(),
                file_path: task_file_path(&description),
                is_parallel: caps.get(3).is_some(),
                user_story: caps.get(4).map(|m| m.as_str().to_string()),
                completed: caps[1].eq_ignore_ascii_case("x"),
                description,
            }
        })
        .collect()
}

/// Story codes mentioned as headings (`## US1:`) or emphasis (`**US1**`).
pub fn parse_user_story_ids(document: &str) -> BTreeSet<String> {
    Pattern::StoryHeading
        .regex()
        .captures_iter(document)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Heading text following `US<N>:` for the given story, if the spec has one.
pub fn user_story_title(document: &str, story_id: &str) -> Option<String> {
    document.lines().find_map(|line| {
        let rest = line.trim_start_matches('#').trim_start();
        let rest = rest.strip_prefix(story_id)?.strip_prefix(':')?;
        let title = rest.trim().trim_matches('*').trim();
        (!title.is_empty()).then(|| title.to_string())
    })
}

fn task_file_path(description: &str) -> Option<String> {
    Pattern::TaskFilePath
        .regex()
        .captures(description)
        .map(|caps| caps[1].to_string())
}

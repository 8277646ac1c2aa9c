//! Declarative grammar for tracker titles, bodies and CLI output.
//!
//! Every structural pattern the crate relies on lives in one table keyed by
//! [`Pattern`]. Parsers return [`Parsed::Mismatch`] for records that do not
//! belong to the domain instead of failing.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

/// Named patterns with capture semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// `Feature <N>: <Name>` at the start of an issue title. Captures number, name.
    FeatureTitle,
    /// `US<N>: <Description>` at the start of an issue title. Captures number, description.
    StoryTitle,
    /// `Parent: #<N>` anywhere in a story body. Captures issue number.
    ParentRef,
    /// `closes|fixes|resolves #<N>` in a pull request body. Captures issue number.
    LinkedIssue,
    /// `/issues/<N>` in a tracker URL.
    IssueUrl,
    /// `/pull/<N>` in a tracker URL.
    PullUrl,
    /// `- [ |x|X] T<digits> [P]? [US<digits>]? <description>` in a tasks document.
    TaskLine,
    /// Trailing `in <path>` or ``in `path` `` inside a task description.
    TaskFilePath,
    /// `## US<N>:` heading or `**US<N>**` emphasis in a spec document.
    StoryHeading,
}

struct Rule {
    pattern: Pattern,
    source: &'static str,
    case_insensitive: bool,
    multi_line: bool,
}

const RULES: &[Rule] = &[
    Rule {
        pattern: Pattern::FeatureTitle,
        source: r"^Feature\s+(\d+):\s*(.+)",
        case_insensitive: true,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::StoryTitle,
        source: r"^US(\d+):\s*(.+)",
        case_insensitive: true,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::ParentRef,
        source: r"Parent:\s*#(\d+)",
        case_insensitive: true,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::LinkedIssue,
        source: r"(?:closes|fixes|resolves)\s*#(\d+)",
        case_insensitive: true,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::IssueUrl,
        source: r"/issues/(\d+)",
        case_insensitive: false,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::PullUrl,
        source: r"/pull/(\d+)",
        case_insensitive: false,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::TaskLine,
        source: r"- \[([ xX])\] (T\d+)\b[ \t]*(\[P\])?[ \t]*(?:\[(US\d+)\])?[ \t]*(.+)",
        case_insensitive: false,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::TaskFilePath,
        source: r"\bin\s+`?([^`\s]+)`?$",
        case_insensitive: false,
        multi_line: false,
    },
    Rule {
        pattern: Pattern::StoryHeading,
        source: r"(?:##?\s*|^\*\*)(US\d+)[:*]",
        case_insensitive: false,
        multi_line: true,
    },
];

static COMPILED: LazyLock<Vec<(Pattern, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|rule| {
            let regex = RegexBuilder::new(rule.source)
                .case_insensitive(rule.case_insensitive)
                .multi_line(rule.multi_line)
                .build()
                .expect("grammar table patterns are valid");
            (rule.pattern, regex)
        })
        .collect()
});

impl Pattern {
    pub fn regex(self) -> &'static Regex {
        COMPILED
            .iter()
            .find(|(pattern, _)| *pattern == self)
            .map(|(_, regex)| regex)
            .expect("every pattern has a rule")
    }
}

/// Outcome of applying a grammar entry to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    Match(T),
    /// The input is not this kind of record.
    Mismatch,
}

impl<T> Parsed<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Parsed::Match(value) => Some(value),
            Parsed::Mismatch => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Parsed::Match(_))
    }
}

/// Number and name parsed from a feature issue title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTitle {
    pub number: u32,
    pub name: String,
}

/// Story code and parent issue parsed from a story issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryRef {
    /// Normalized `US<N>` code.
    pub id: String,
    pub description: String,
    pub parent_issue: u64,
}

/// True if the title has the feature shape, regardless of whether its number parses.
pub fn looks_like_feature(title: &str) -> bool {
    Pattern::FeatureTitle.regex().is_match(title)
}

/// Parse `Feature <N>: <Name>`. A number that does not fit is a mismatch.
pub fn parse_feature_title(title: &str) -> Parsed<FeatureTitle> {
    let Some(caps) = Pattern::FeatureTitle.regex().captures(title) else {
        return Parsed::Mismatch;
    };
    let Ok(number) = caps[1].parse::<u32>() else {
        return Parsed::Mismatch;
    };
    Parsed::Match(FeatureTitle {
        number,
        name: caps[2].trim().to_string(),
    })
}

/// Parse a story issue: `US<N>: ...` title plus `Parent: #<N>` in the body.
pub fn parse_story(title: &str, body: &str) -> Parsed<StoryRef> {
    let Some(caps) = Pattern::StoryTitle.regex().captures(title) else {
        return Parsed::Mismatch;
    };
    let Some(parent_issue) = parent_ref(body) else {
        return Parsed::Mismatch;
    };
    Parsed::Match(StoryRef {
        id: format!("US{}", &caps[1]),
        description: caps[2].trim().to_string(),
        parent_issue,
    })
}

/// First `Parent: #<N>` back-reference in `body`.
pub fn parent_ref(body: &str) -> Option<u64> {
    first_number(Pattern::ParentRef, body)
}

/// All issues linked from a pull request body, in order of appearance.
pub fn linked_issues(body: &str) -> Vec<u64> {
    Pattern::LinkedIssue
        .regex()
        .captures_iter(body)
        .filter_map(|caps| caps[1].parse().ok())
        .collect()
}

pub fn issue_number_from_url(text: &str) -> Option<u64> {
    first_number(Pattern::IssueUrl, text)
}

pub fn pull_number_from_url(text: &str) -> Option<u64> {
    first_number(Pattern::PullUrl, text)
}

fn first_number(pattern: Pattern, text: &str) -> Option<u64> {
    pattern
        .regex()
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_title_parses_number_and_name() {
        let parsed = parse_feature_title("feature 17: If Then Else  ");
        assert_eq!(
            parsed,
            Parsed::Match(FeatureTitle {
                number: 17,
                name: "If Then Else".to_string(),
            })
        );
    }

    #[test]
    fn feature_title_must_be_at_start() {
        assert!(!parse_feature_title("Bug in Feature 3: loops").is_match());
    }

    #[test]
    fn overflowing_feature_number_is_mismatch() {
        let title = "Feature 99999999999999999999: Huge";
        assert!(looks_like_feature(title));
        assert_eq!(parse_feature_title(title), Parsed::Mismatch);
    }

    #[test]
    fn story_requires_parent_reference() {
        assert_eq!(parse_story("US1: Login", "no parent here"), Parsed::Mismatch);
        let parsed = parse_story("us2: Logout", "Body\nparent: #42\n").ok();
        assert_eq!(
            parsed,
            Some(StoryRef {
                id: "US2".to_string(),
                description: "Logout".to_string(),
                parent_issue: 42,
            })
        );
    }

    #[test]
    fn linked_issues_collects_every_keyword() {
        let body = "Closes #3, fixes #7 and Resolves #11. See #99.";
        assert_eq!(linked_issues(body), vec![3, 7, 11]);
    }

    #[test]
    fn url_numbers() {
        assert_eq!(
            issue_number_from_url("https://github.com/o/r/issues/123\n"),
            Some(123)
        );
        assert_eq!(pull_number_from_url("https://github.com/o/r/pull/9"), Some(9));
        assert_eq!(pull_number_from_url("https://github.com/o/r/issues/9"), None);
    }
}

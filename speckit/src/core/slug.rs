//! Branch slug helpers.

/// Lower-case `text`, collapse every run of non `[a-z0-9]` characters into one
/// hyphen, and trim hyphens from both ends.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Feature branch name: `{number:03}-{slug(name)}`.
pub fn branch_name(number: u32, name: &str) -> String {
    format!("{number:03}-{}", slugify(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("  If / Then -- Else!  "), "if-then-else");
        assert_eq!(slugify("Already-slugged"), "already-slugged");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn slugify_drops_non_ascii_letters() {
        assert_eq!(slugify("Café Über"), "caf-ber");
    }

    #[test]
    fn slugify_is_idempotent_and_well_formed() {
        let samples = [
            "",
            "Hello World",
            "--a--b--",
            "UPPER_case 42",
            "tabs\tand\nnewlines",
            "ümlaut ß",
            "a",
            "9 lives",
        ];
        for sample in samples {
            let once = slugify(sample);
            assert_eq!(slugify(&once), once, "sample {sample:?}");
            assert!(!once.starts_with('-') && !once.ends_with('-'));
            assert!(!once.contains("--"));
            assert!(
                once.chars()
                    .all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit())
            );
        }
    }

    #[test]
    fn branch_name_pads_number() {
        assert_eq!(branch_name(17, "If Then Else"), "017-if-then-else");
        assert_eq!(branch_name(1234, "Big"), "1234-big");
    }
}

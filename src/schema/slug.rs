/// Returns the given string in a "foo-bar-yes" format
///
/// Runs of characters outside `[0-9a-zA-Z]` collapse to a single `-`, the
/// result is trimmed of leading/trailing dashes and lowercased.
pub fn make_slug(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    let mut pending_dash = false;

    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Parses a human formatted count such as `"12,123"` or `"5/5"`
///
/// All non-digit characters are stripped before parsing; anything that
/// still fails to parse counts as zero.
pub fn parse_count(s: &str) -> u64 {
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Drops empty strings, preserving order
pub fn remove_empty(items: Vec<String>) -> Vec<String> {
    items.into_iter().filter(|item| !item.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_slug() {
        assert_eq!(make_slug("Foo Bar"), "foo-bar");
        assert_eq!(make_slug("  Foo Bar 112 "), "foo-bar-112");
        assert_eq!(make_slug("foo bar_Yes1"), "foo-bar-yes1");
        assert_eq!(make_slug("Peter Parker & Tony Stark"), "peter-parker-tony-stark");
        assert_eq!(make_slug("The Avengers (Marvel Movies)"), "the-avengers-marvel-movies");
    }

    #[test]
    fn test_make_slug_degenerate() {
        assert_eq!(make_slug(""), "");
        assert_eq!(make_slug("---"), "");
        assert_eq!(make_slug("Ünïcode"), "n-code");
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("12,123"), 12123);
        assert_eq!(parse_count(""), 0);
        assert_eq!(parse_count("123"), 123);
        assert_eq!(parse_count("5/5"), 55);
        assert_eq!(parse_count("n/a"), 0);
    }

    #[test]
    fn test_remove_empty() {
        let items = vec!["a".to_string(), String::new(), "b".to_string()];
        assert_eq!(remove_empty(items), vec!["a", "b"]);
    }
}

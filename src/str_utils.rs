use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Returns a log-friendly preview: the first `n` characters plus an ellipsis
/// when the input was cut.
pub fn snippet(s: &str, n: usize) -> Cow<'_, str> {
    let prefix = prefix_chars(s, n);
    if prefix.len() == s.len() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}...", prefix))
    }
}

/// Drops a trailing run of one or two backticks that stands on its own, i.e.
/// a fence marker that is still arriving. A backtick closing inline code
/// (directly after a non-space character) is kept.
pub fn trim_partial_fence(s: &str) -> &str {
    let body = s.trim_end_matches('`');
    let run = s.len() - body.len();
    if (1..=2).contains(&run) && (body.is_empty() || body.ends_with(char::is_whitespace)) {
        body.trim_end()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_chars_multibyte() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(prefix_chars("hi", 10), "hi");
    }

    #[test]
    fn test_snippet_marks_truncation() {
        assert_eq!(snippet("abcdef", 3), "abc...");
        assert_eq!(snippet("abc", 3), "abc");
    }

    #[test]
    fn test_trim_partial_fence() {
        assert_eq!(trim_partial_fence("tail text ``"), "tail text");
        assert_eq!(trim_partial_fence("`"), "");
        assert_eq!(trim_partial_fence("Run `ls`"), "Run `ls`");
        assert_eq!(trim_partial_fence("`x` first"), "`x` first");
        assert_eq!(trim_partial_fence("plain"), "plain");
    }
}

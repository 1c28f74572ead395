//! Text formatting for the Telegram surface.
//!
//! Telegram messages are sent with parse_mode=HTML and a small whitelist of
//! tags (b, i, s, code, pre, a, blockquote). Assistant output is markdown,
//! so a minimal converter covers the constructs Claude actually emits.

use regex::Regex;

/// Telegram rejects bodies above 4096; we cut at 4000 and say so.
pub const MAX_MESSAGE_LEN: usize = 4000;
pub const TRUNCATION_SENTINEL: &str = "\n... (truncated)";

/// Escape the three characters HTML parse mode cares about.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Safely truncate a string to at most `max_chars` characters.
/// Unlike byte slicing `&s[..n]`, this won't panic on multi-byte UTF-8.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Shorten a string to `n` characters, appending "..." when cut.
pub fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        return s.to_string();
    }
    format!("{}...", truncate_chars(s, n))
}

/// Apply the outgoing message length cap with the truncation sentinel.
pub fn clamp_message(s: &str) -> String {
    if s.chars().count() <= MAX_MESSAGE_LEN {
        return s.to_string();
    }
    format!("{}{}", truncate_chars(s, MAX_MESSAGE_LEN), TRUNCATION_SENTINEL)
}

/// Convert the markdown subset Claude emits into Telegram HTML.
///
/// HTML metacharacters are escaped first, then markdown spans are rewritten.
/// Fenced code blocks run before inline code so ``` fences are not consumed
/// by the single-backtick rule.
pub fn markdown_to_html(input: &str) -> String {
    let mut s = html_escape(input);

    let fenced = Regex::new(r"(?s)```[a-zA-Z0-9_+-]*\n?(.*?)\n?```").unwrap();
    s = fenced.replace_all(&s, "<pre>$1</pre>").into_owned();

    let inline_code = Regex::new(r"`([^`\n]+)`").unwrap();
    s = inline_code.replace_all(&s, "<code>$1</code>").into_owned();

    let bold_stars = Regex::new(r"\*\*([^*]+)\*\*").unwrap();
    s = bold_stars.replace_all(&s, "<b>$1</b>").into_owned();

    let bold_under = Regex::new(r"__([^_]+)__").unwrap();
    s = bold_under.replace_all(&s, "<b>$1</b>").into_owned();

    let italic = Regex::new(r"\*([^*\n]+)\*").unwrap();
    s = italic.replace_all(&s, "<i>$1</i>").into_owned();

    let strike = Regex::new(r"~~([^~]+)~~").unwrap();
    s = strike.replace_all(&s, "<s>$1</s>").into_owned();

    let link = Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").unwrap();
    s = link.replace_all(&s, r#"<a href="$2">$1</a>"#).into_owned();

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- markdown_to_html ----

    #[test]
    fn markdown_table() {
        let cases = [
            ("hello world", "hello world"),
            ("a < b & c > d", "a &lt; b &amp; c &gt; d"),
            ("**bold**", "<b>bold</b>"),
            ("__bold__", "<b>bold</b>"),
            ("*italic*", "<i>italic</i>"),
            ("~~deleted~~", "<s>deleted</s>"),
            ("use `fmt.Println`", "use <code>fmt.Println</code>"),
            ("use `a<b>c`", "use <code>a&lt;b&gt;c</code>"),
            ("```go\nfmt.Println(\"hi\")\n```", "<pre>fmt.Println(\"hi\")</pre>"),
            ("```\na < b\n```", "<pre>a &lt; b</pre>"),
            (
                "[Google](https://google.com)",
                r#"<a href="https://google.com">Google</a>"#,
            ),
            ("**bold** and `code`", "<b>bold</b> and <code>code</code>"),
            ("just plain text 🎉", "just plain text 🎉"),
        ];
        for (input, want) in cases {
            assert_eq!(markdown_to_html(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn fenced_block_spans_lines() {
        let out = markdown_to_html("before\n```\nline1\nline2\n```\nafter");
        assert_eq!(out, "before\n<pre>line1\nline2</pre>\nafter");
    }

    // ---- truncation ----

    #[test]
    fn clamp_keeps_short_messages() {
        let msg = "a".repeat(MAX_MESSAGE_LEN);
        assert_eq!(clamp_message(&msg), msg);
    }

    #[test]
    fn clamp_cuts_at_4000_with_sentinel() {
        let msg = "a".repeat(MAX_MESSAGE_LEN + 1);
        let out = clamp_message(&msg);
        assert_eq!(out.len(), MAX_MESSAGE_LEN + TRUNCATION_SENTINEL.len());
        assert!(out.ends_with(TRUNCATION_SENTINEL));
    }

    #[test]
    fn truncate_chars_is_utf8_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate("ab", 5), "ab");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn html_escape_order_does_not_double_escape() {
        assert_eq!(html_escape("&<>"), "&amp;&lt;&gt;");
    }
}

//! Markdown utilities: deterministic cleanup and the pure caption rewrite.
//!
//! ## Cleanup rules
//!
//! Applied in order by [`clean_markdown`]:
//!
//! 1. Normalise line endings (CRLF / CR → LF)
//! 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 3. Trim trailing whitespace per line
//! 4. Collapse runs of more than two blank lines
//! 5. Ensure the text ends with exactly one newline
//!
//! Each rule is a `&str → String` function with no shared state.

use crate::prompts::wrap_caption;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

/// Apply every cleanup rule to extracted Markdown.
pub fn clean_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 5: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Caption rewrite ──────────────────────────────────────────────────────────

/// Replace each span with its wrapped caption.
///
/// `replacements` must be sorted by span start and non-overlapping; the
/// result is independent of the order captions were produced in. Lines are
/// right-trimmed and the result ends with a single newline.
pub fn rewrite_with_captions(markdown: &str, replacements: &[(Range<usize>, String)]) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut cursor = 0;
    for (span, caption) in replacements {
        debug_assert!(span.start >= cursor, "replacements out of order");
        out.push_str(&markdown[cursor..span.start]);
        out.push_str(&wrap_caption(caption));
        cursor = span.end;
    }
    out.push_str(&markdown[cursor..]);
    let trimmed = trim_trailing_whitespace(&out);
    ensure_final_newline(&trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn test_remove_invisible() {
        assert_eq!(
            remove_invisible_chars("Q3\u{200B} revenue\u{FEFF}"),
            "Q3 revenue"
        );
    }

    #[test]
    fn test_clean_markdown() {
        let out = clean_markdown("# Report  \r\n\r\n\r\n\r\n\r\nQ3 revenue rose 12%   ");
        assert_eq!(out, "# Report\n\n\nQ3 revenue rose 12%\n");
    }

    #[test]
    fn rewrite_applies_in_span_order() {
        let md = "A ![1](a.png) B ![2](b.png) C\n";
        let first = md.find("![1]").unwrap();
        let second = md.find("![2]").unwrap();
        let replacements = vec![
            (first..first + "![1](a.png)".len(), "first".to_string()),
            (second..second + "![2](b.png)".len(), "second".to_string()),
        ];
        assert_eq!(
            rewrite_with_captions(md, &replacements),
            "A <!-- figure -->first<!-- /figure --> B <!-- figure -->second<!-- /figure --> C\n"
        );
    }

    #[test]
    fn rewrite_keeps_multibyte_text_around_spans() {
        let md = "매출 ![도표](image-001.png) 증가\n";
        let start = md.find("![").unwrap();
        let end = md.find(") ").unwrap() + 1;
        assert_eq!(
            rewrite_with_captions(md, &[(start..end, "막대 그래프".to_string())]),
            "매출 <!-- figure -->막대 그래프<!-- /figure --> 증가\n"
        );
    }

    #[test]
    fn rewrite_without_images_only_normalises() {
        assert_eq!(rewrite_with_captions("text  \n\n", &[]), "text\n");
    }
}

//! Prompts and fixed strings shared by the enrichment and synthesis stages.
//!
//! The caption prompt participates in caption cache keys (through its content
//! hash), so editing it invalidates old captions without any manual purge.
//! Callers can override it via [`crate::config::ServerConfig::caption_prompt`].

/// Default prompt sent with every embedded image.
pub const DEFAULT_CAPTION_PROMPT: &str = r#"You are describing a single image taken from a business or technical document.

Write a concise, factual description that lets someone answer questions about the document without seeing the image:

- For charts and graphs: name the chart type, the axes, the series, and the key values or trends.
- For tables rendered as images: transcribe the header row and the most important rows.
- For diagrams: name the components and how they connect.
- For photos and logos: one sentence is enough.

Rules:
- Transcribe any visible text exactly.
- Do NOT speculate about content that is not visible.
- Do NOT add commentary, headings, or Markdown fences.
- Answer in the language of the text in the image, if any."#;

/// Caption substituted for an image whose caption could not be produced.
pub const PLACEHOLDER_CAPTION: &str = "[image caption unavailable]";

/// Marker opening an inserted caption block.
pub const CAPTION_OPEN: &str = "<!-- figure -->";

/// Marker closing an inserted caption block.
pub const CAPTION_CLOSE: &str = "<!-- /figure -->";

/// System prompt for document question answering.
pub const ANSWER_SYSTEM_PROMPT: &str = r#"You answer questions about a single document. The full document is provided as Markdown; figures have been replaced by textual descriptions wrapped in <!-- figure --> markers.

Rules:
1. Answer ONLY from the document. If the document does not contain the answer, say so plainly.
2. Quote numbers, names, and dates exactly as they appear.
3. When the answer comes from a figure description, say that it comes from a figure.
4. Keep the answer short unless the question asks for detail.
5. Answer in the language of the question."#;

/// System prompt for grounded web search.
pub const SEARCH_SYSTEM_PROMPT: &str = r#"You are a research assistant with access to Google Search.
Search the web for the user's query and answer with a concise, factual summary.
Prefer recent and authoritative sources. Do not invent sources."#;

/// Build the user turn for answer synthesis.
///
/// The document goes first so the question sits closest to the end of the
/// context window.
pub fn answer_user_prompt(markdown: &str, question: &str) -> String {
    format!(
        "<document>\n{}\n</document>\n\nQuestion: {}",
        markdown.trim_end(),
        question.trim()
    )
}

/// Wrap a caption in figure markers.
pub fn wrap_caption(caption: &str) -> String {
    format!("{CAPTION_OPEN}{}{CAPTION_CLOSE}", caption.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_contains_both_parts() {
        let p = answer_user_prompt("# Report\n\nRevenue rose 12%.\n\n", "  How did revenue change? ");
        assert!(p.starts_with("<document>\n# Report"));
        assert!(p.ends_with("Question: How did revenue change?"));
        assert!(p.contains("Revenue rose 12%.\n</document>"));
    }

    #[test]
    fn wrap_caption_trims() {
        assert_eq!(
            wrap_caption("  A bar chart.\n"),
            "<!-- figure -->A bar chart.<!-- /figure -->"
        );
    }

    #[test]
    fn answer_prompt_mentions_markers() {
        assert!(ANSWER_SYSTEM_PROMPT.contains(CAPTION_OPEN));
    }
}

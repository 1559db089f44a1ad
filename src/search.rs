//! Grounded web search: one generation call with the search tool attached.
//!
//! No pipeline and no caching; results are only as fresh as the search.

use crate::error::{DocQaError, Stage};
use crate::orchestrator::RunContext;
use crate::prompts::SEARCH_SYSTEM_PROMPT;
use crate::services::{GenerationRequest, GenerationService, ServiceError, Source};
use std::sync::Arc;
use tracing::info;

pub struct WebSearch {
    generator: Arc<dyn GenerationService>,
    model: String,
    max_output_tokens: usize,
}

impl WebSearch {
    pub fn new(
        generator: Arc<dyn GenerationService>,
        model: impl Into<String>,
        max_output_tokens: usize,
    ) -> Self {
        Self {
            generator,
            model: model.into(),
            max_output_tokens,
        }
    }

    /// Search for `query` and return the summary with its sources appended.
    pub async fn search(&self, query: &str, ctx: &RunContext) -> Result<String, DocQaError> {
        ctx.checkpoint(Stage::Search)?;
        ctx.observer().on_stage_start(Stage::Search);

        let request = GenerationRequest {
            model: self.model.clone(),
            system: Some(SEARCH_SYSTEM_PROMPT.to_string()),
            prompt: query.trim().to_string(),
            temperature: None,
            max_output_tokens: Some(self.max_output_tokens),
            grounded: true,
        };
        let generation = ctx
            .bounded(Stage::Search, async {
                self.generator
                    .generate(&request)
                    .await
                    .map_err(search_failure)
            })
            .await?;

        if generation.text.trim().is_empty() {
            return Err(DocQaError::SearchFailed {
                detail: "the search returned no text".into(),
            });
        }
        info!(
            "Search answered with {} chars and {} sources",
            generation.text.len(),
            generation.sources.len()
        );
        ctx.observer().on_stage_complete(Stage::Search, false);
        Ok(render_result(generation.text.trim(), &generation.sources))
    }
}

fn search_failure(e: ServiceError) -> DocQaError {
    let detail = match e {
        ServiceError::Unsupported(what) => {
            format!("{what}. Web search needs a Gemini API key (set GEMINI_API_KEY).")
        }
        other => other.to_string(),
    };
    DocQaError::SearchFailed { detail }
}

fn render_result(text: &str, sources: &[Source]) -> String {
    if sources.is_empty() {
        return text.to_string();
    }
    let mut out = String::from(text);
    out.push_str("\n\nSources:\n");
    for (i, source) in sources.iter().enumerate() {
        let title = if source.title.trim().is_empty() {
            &source.uri
        } else {
            &source.title
        };
        out.push_str(&format!("{}. {} - {}\n", i + 1, title, source.uri));
    }
    out.trim_end().to_string()
}

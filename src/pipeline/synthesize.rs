//! Answer synthesis: one low-temperature generation over the captioned
//! Markdown.

use crate::error::DocQaError;
use crate::prompts::{answer_user_prompt, ANSWER_SYSTEM_PROMPT};
use crate::services::{GenerationRequest, GenerationService};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: usize,
}

pub struct AnswerSynthesizer {
    generator: Arc<dyn GenerationService>,
    settings: SynthesisSettings,
}

impl AnswerSynthesizer {
    pub fn new(generator: Arc<dyn GenerationService>, settings: SynthesisSettings) -> Self {
        Self {
            generator,
            settings,
        }
    }

    pub fn settings(&self) -> &SynthesisSettings {
        &self.settings
    }

    /// Ask `question` against `markdown`. Any service failure, including an
    /// empty answer, is terminal.
    pub async fn answer(&self, markdown: &str, question: &str) -> Result<String, DocQaError> {
        let request = GenerationRequest {
            model: self.settings.model.clone(),
            system: Some(ANSWER_SYSTEM_PROMPT.to_string()),
            prompt: answer_user_prompt(markdown, question),
            temperature: Some(self.settings.temperature),
            max_output_tokens: Some(self.settings.max_output_tokens),
            grounded: false,
        };
        debug!(
            "Synthesis prompt: {} chars of context, model {}",
            markdown.len(),
            request.model
        );

        let generation = self
            .generator
            .generate(&request)
            .await
            .map_err(|e| DocQaError::SynthesisFailed {
                detail: e.to_string(),
            })?;

        let answer = generation.text.trim();
        if answer.is_empty() {
            return Err(DocQaError::SynthesisFailed {
                detail: "the model returned an empty answer".into(),
            });
        }
        info!("Answer generated: {} chars", answer.len());
        Ok(answer.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{Generation, ServiceError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<GenerationRequest>>,
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl GenerationService for Recording {
        async fn generate(&self, req: &GenerationRequest) -> Result<Generation, ServiceError> {
            self.seen.lock().unwrap().push(req.clone());
            match &self.reply {
                Ok(text) => Ok(Generation {
                    text: text.clone(),
                    sources: Vec::new(),
                }),
                Err(()) => Err(ServiceError::Permanent {
                    detail: "400".into(),
                }),
            }
        }
    }

    fn synth(reply: Result<String, ()>) -> (Arc<Recording>, AnswerSynthesizer) {
        let r = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            reply,
        });
        let s = AnswerSynthesizer::new(
            r.clone(),
            SynthesisSettings {
                model: "answer-test".into(),
                temperature: 0.1,
                max_output_tokens: 1024,
            },
        );
        (r, s)
    }

    #[tokio::test]
    async fn embeds_document_and_question() {
        let (r, s) = synth(Ok("  Revenue rose 12%.\n".into()));
        let answer = s.answer("Q3 revenue rose 12%\n", "What happened?").await.unwrap();
        assert_eq!(answer, "Revenue rose 12%.");
        let seen = r.seen.lock().unwrap();
        assert!(seen[0].prompt.contains("Q3 revenue rose 12%"));
        assert!(seen[0].prompt.contains("What happened?"));
        assert_eq!(seen[0].temperature, Some(0.1));
        assert!(!seen[0].grounded);
    }

    #[tokio::test]
    async fn failures_are_synthesis_failed() {
        let (_, s) = synth(Err(()));
        let err = s.answer("doc", "q").await.unwrap_err();
        assert_eq!(err.code(), "SYNTHESIS_FAILED");

        let (_, s) = synth(Ok("   ".into()));
        assert!(matches!(
            s.answer("doc", "q").await,
            Err(DocQaError::SynthesisFailed { .. })
        ));
    }
}

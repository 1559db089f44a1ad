//! Fallback backend over an `edgequake-llm` provider.
//!
//! Used when no Gemini API key is configured. Any vision-capable provider the
//! factory knows (OpenAI, Anthropic, Gemini, Ollama, Azure, ...) can caption
//! images and synthesize answers. Search grounding is Gemini-specific and is
//! reported as [`ServiceError::Unsupported`].
//!
//! ## Provider resolution
//!
//! Most-specific first:
//!
//! 1. **Named provider** (`ServerConfig::provider_name`) with
//!    `provider_model`, or `EDGEQUAKE_MODEL`, or the provider's default.
//! 2. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
//! 3. **Auto-detection** via [`ProviderFactory::from_env`], which picks the
//!    first provider whose API key variable is set.
//!
//! The model name carried on each request is a Gemini model id and is not
//! forwarded; the provider keeps the model it was created with.

use super::{CaptionService, Generation, GenerationRequest, GenerationService, ServiceError};
use crate::config::ServerConfig;
use crate::error::DocQaError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ProviderService {
    provider: Arc<dyn LLMProvider>,
    caption_max_tokens: usize,
}

impl std::fmt::Debug for ProviderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderService").finish_non_exhaustive()
    }
}

impl ProviderService {
    /// Wrap an already configured provider.
    pub fn new(provider: Arc<dyn LLMProvider>, caption_max_tokens: usize) -> Self {
        Self {
            provider,
            caption_max_tokens,
        }
    }

    /// Resolve a provider from the config and environment.
    pub fn from_config(config: &ServerConfig) -> Result<Self, DocQaError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config.caption_max_tokens))
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ServiceError> {
        let response = self
            .provider
            .chat(messages, Some(options))
            .await
            .map_err(|e| classify_llm_error(&e.to_string()))?;
        debug!(
            "Provider call: {} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );
        if response.content.trim().is_empty() {
            return Err(ServiceError::Permanent {
                detail: "provider returned an empty response".into(),
            });
        }
        Ok(response.content)
    }
}

#[async_trait]
impl GenerationService for ProviderService {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ServiceError> {
        if request.grounded {
            return Err(ServiceError::Unsupported(
                "search grounding requires a Gemini API key (set GEMINI_API_KEY)".into(),
            ));
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(request.prompt.as_str()));

        let options = CompletionOptions {
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            ..Default::default()
        };
        let text = self.chat(&messages, &options).await?;
        Ok(Generation {
            text,
            sources: Vec::new(),
        })
    }
}

#[async_trait]
impl CaptionService for ProviderService {
    async fn caption(
        &self,
        _model: &str,
        image: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<String, ServiceError> {
        let image_data = ImageData::new(STANDARD.encode(image), mime).with_detail("high");
        let messages = vec![ChatMessage::user_with_images(prompt, vec![image_data])];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(self.caption_max_tokens),
            ..Default::default()
        };
        self.chat(&messages, &options).await
    }

    /// The provider keeps the model it was created with, so a requested
    /// Gemini model id has no effect here.
    fn caption_model(&self, _requested: &str) -> String {
        format!("{}:{}", self.provider.name(), self.provider.model())
    }
}

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, DocQaError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        DocQaError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn resolve_provider(config: &ServerConfig) -> Result<Arc<dyn LLMProvider>, DocQaError> {
    let env_model = std::env::var("EDGEQUAKE_MODEL")
        .ok()
        .filter(|m| !m.is_empty());

    // 1) Named provider
    if let Some(ref name) = config.provider_name {
        let model = config
            .provider_model
            .clone()
            .or(env_model)
            .unwrap_or_default();
        info!("Using provider '{}' (model '{}')", name, model);
        return create_provider(name, &model);
    }

    // 2) Environment pair
    if let (Ok(prov), Some(model)) = (std::env::var("EDGEQUAKE_LLM_PROVIDER"), env_model) {
        if !prov.is_empty() {
            info!("Using provider '{}' (model '{}') from environment", prov, model);
            return create_provider(&prov, &model);
        }
    }

    // 3) Auto-detect
    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| DocQaError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No generation backend is configured.\n\
                Set GEMINI_API_KEY, or an edgequake-llm provider key such as \
                OPENAI_API_KEY or ANTHROPIC_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

/// Classify a provider error from its message.
///
/// Provider errors do not expose HTTP status codes uniformly, so the status
/// is recovered from the rendered message.
fn classify_llm_error(message: &str) -> ServiceError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        ServiceError::RateLimited { retry_after: None }
    } else if ["401", "403", "unauthorized", "invalid api key", "content_filter", "400 "]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        ServiceError::Permanent {
            detail: message.to_string(),
        }
    } else {
        ServiceError::Transient {
            detail: message.to_string(),
        }
    }
}

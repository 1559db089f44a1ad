//! Configuration for the tool server and the document pipeline.
//!
//! Every knob lives in [`ServerConfig`], built via [`ServerConfigBuilder`].
//! The binary maps command-line flags and environment variables onto the
//! builder; the library only ever reads the finished config.

use crate::error::DocQaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SEARCH_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_ANSWER_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_VISION_MODEL: &str = "gemini-2.5-flash-lite";
pub const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration consumed read-only by the pipeline and dispatcher.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Gemini API key. When absent the edgequake-llm provider fallback is used.
    pub api_key: Option<String>,

    /// Base URL of the Gemini REST API.
    pub api_base_url: String,

    /// Fallback provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Model for the fallback provider. The Gemini model names above are not
    /// forwarded to other providers.
    pub provider_model: Option<String>,

    /// Model used for grounded web search. Default: gemini-2.5-flash.
    pub search_model: String,

    /// Model used for document answers. Default: gemini-2.5-flash.
    pub answer_model: String,

    /// Vision model used for image captions. Default: gemini-2.5-flash-lite.
    pub vision_model: String,

    /// Sampling temperature for answer synthesis. Default: 0.1.
    ///
    /// Answers should stay close to the document text; low temperature keeps
    /// the model from embellishing.
    pub temperature: f32,

    /// Maximum tokens generated per answer or search. Default: 8192.
    pub max_output_tokens: usize,

    /// Maximum tokens generated per caption. Default: 512.
    pub caption_max_tokens: usize,

    /// Custom caption prompt. If None, uses the built-in default.
    pub caption_prompt: Option<String>,

    /// Concurrent caption calls per document. Default: 4.
    pub caption_concurrency: usize,

    /// Concurrent tool calls across the server. Default: 4.
    pub request_concurrency: usize,

    /// Overall deadline for one tool call, in seconds. Default: 300.
    pub request_timeout_secs: u64,

    /// Budget for the enrichment stage, in seconds. Default: 120.
    ///
    /// When it runs out, resolved captions are kept and the rest receive the
    /// placeholder.
    pub enrich_timeout_secs: u64,

    /// Per external API call timeout, in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Maximum retry attempts on a transient caption failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Converter executable. Default: "soffice".
    pub converter_program: String,

    /// Attempts per document conversion. Default: 3.
    pub conversion_attempts: u32,

    /// Timeout for a single conversion run, in seconds. Default: 120.
    pub conversion_timeout_secs: u64,

    /// Root directory of the content cache.
    pub cache_dir: PathBuf,

    /// Upper bound on cached payload bytes; None disables eviction. Default: 2 GiB.
    pub cache_max_bytes: Option<u64>,

    /// Cache synthesized answers keyed by the question fingerprint. Default: false.
    pub cache_answers: bool,

    /// Embedded images with a side shorter than this are skipped. Default: 32.
    pub min_image_side: u32,

    /// PDF user password for encrypted documents.
    pub pdf_password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            provider_name: None,
            provider_model: None,
            search_model: DEFAULT_SEARCH_MODEL.to_string(),
            answer_model: DEFAULT_ANSWER_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            temperature: 0.1,
            max_output_tokens: 8192,
            caption_max_tokens: 512,
            caption_prompt: None,
            caption_concurrency: 4,
            request_concurrency: 4,
            request_timeout_secs: 300,
            enrich_timeout_secs: 120,
            api_timeout_secs: 60,
            max_retries: 3,
            retry_backoff_ms: 500,
            converter_program: "soffice".to_string(),
            conversion_attempts: 3,
            conversion_timeout_secs: 120,
            cache_dir: default_cache_dir(),
            cache_max_bytes: Some(2 * 1024 * 1024 * 1024),
            cache_answers: false,
            min_image_side: 32,
            pdf_password: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("provider_name", &self.provider_name)
            .field("provider_model", &self.provider_model)
            .field("search_model", &self.search_model)
            .field("answer_model", &self.answer_model)
            .field("vision_model", &self.vision_model)
            .field("temperature", &self.temperature)
            .field("caption_concurrency", &self.caption_concurrency)
            .field("request_concurrency", &self.request_concurrency)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("enrich_timeout_secs", &self.enrich_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("cache_dir", &self.cache_dir)
            .field("cache_max_bytes", &self.cache_max_bytes)
            .field("cache_answers", &self.cache_answers)
            .finish()
    }
}

impl ServerConfig {
    /// Create a new builder for `ServerConfig`.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_secs(self.enrich_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }
}

/// `$XDG_CACHE_HOME/gemini-search-mcp`, falling back to the temp dir.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("gemini-search-mcp")
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.config.api_key = if key.trim().is_empty() { None } else { Some(key) };
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider_model(mut self, model: impl Into<String>) -> Self {
        self.config.provider_model = Some(model.into());
        self
    }

    pub fn search_model(mut self, model: impl Into<String>) -> Self {
        self.config.search_model = model.into();
        self
    }

    pub fn answer_model(mut self, model: impl Into<String>) -> Self {
        self.config.answer_model = model.into();
        self
    }

    pub fn vision_model(mut self, model: impl Into<String>) -> Self {
        self.config.vision_model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.max_output_tokens = n;
        self
    }

    pub fn caption_max_tokens(mut self, n: usize) -> Self {
        self.config.caption_max_tokens = n;
        self
    }

    pub fn caption_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.caption_prompt = Some(prompt.into());
        self
    }

    pub fn caption_concurrency(mut self, n: usize) -> Self {
        self.config.caption_concurrency = n.max(1);
        self
    }

    pub fn request_concurrency(mut self, n: usize) -> Self {
        self.config.request_concurrency = n.max(1);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn enrich_timeout_secs(mut self, secs: u64) -> Self {
        self.config.enrich_timeout_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn converter_program(mut self, program: impl Into<String>) -> Self {
        self.config.converter_program = program.into();
        self
    }

    pub fn conversion_attempts(mut self, n: u32) -> Self {
        self.config.conversion_attempts = n.max(1);
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.conversion_timeout_secs = secs;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn cache_max_bytes(mut self, bytes: Option<u64>) -> Self {
        self.config.cache_max_bytes = bytes;
        self
    }

    pub fn cache_answers(mut self, v: bool) -> Self {
        self.config.cache_answers = v;
        self
    }

    pub fn min_image_side(mut self, px: u32) -> Self {
        self.config.min_image_side = px;
        self
    }

    pub fn pdf_password(mut self, pwd: impl Into<String>) -> Self {
        self.config.pdf_password = Some(pwd.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServerConfig, DocQaError> {
        let c = &self.config;
        if c.request_timeout_secs == 0 {
            return Err(DocQaError::InvalidConfig(
                "Request timeout must be ≥ 1s".into(),
            ));
        }
        if c.enrich_timeout_secs > c.request_timeout_secs {
            return Err(DocQaError::InvalidConfig(format!(
                "Enrichment budget ({}s) exceeds the request timeout ({}s)",
                c.enrich_timeout_secs, c.request_timeout_secs
            )));
        }
        for (name, model) in [
            ("search", &c.search_model),
            ("answer", &c.answer_model),
            ("vision", &c.vision_model),
        ] {
            if model.trim().is_empty() {
                return Err(DocQaError::InvalidConfig(format!(
                    "The {name} model name must not be empty"
                )));
            }
        }
        if c.cache_max_bytes == Some(0) {
            return Err(DocQaError::InvalidConfig(
                "Cache bound must be positive; pass None to disable eviction".into(),
            ));
        }
        Ok(self.config)
    }
}

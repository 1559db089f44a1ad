//! Capability traits for the external collaborators.
//!
//! The pipeline never talks to an HTTP API or a subprocess directly; it holds
//! `Arc<dyn GenerationService>`, `Arc<dyn CaptionService>` and
//! `Arc<dyn DocumentConverter>`. Production implementations live in the
//! submodules; tests substitute deterministic fakes.
//!
//! ```text
//! GenerationService ── gemini::GeminiClient   (REST, grounded search)
//!                   └─ provider::ProviderService (edgequake-llm fallback)
//! CaptionService    ── same two backends, image + prompt
//! DocumentConverter ── soffice::SofficeConverter (LibreOffice headless)
//! ```

pub mod gemini;
pub mod provider;
pub mod soffice;

pub use gemini::GeminiClient;
pub use provider::ProviderService;
pub use soffice::SofficeConverter;

use crate::pipeline::document::MediaType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<usize>,
    /// Attach the search-grounding tool to the call.
    pub grounded: bool,
}

/// A web source the model grounded its answer on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub sources: Vec<Source>,
}

/// Failure classes of a collaborator call. Drives the retry policy.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Network error, timeout, or 5xx. Worth retrying.
    #[error("transient service error: {detail}")]
    Transient { detail: String },

    /// 429. Retry no sooner than `retry_after` when the service said so.
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// The service refused the request; retrying will not help.
    #[error("request rejected: {detail}")]
    Permanent { detail: String },

    /// The backend lacks the requested capability (e.g. grounding).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Transient { .. } | ServiceError::RateLimited { .. }
        )
    }
}

/// Failure of an external document conversion.
#[derive(Debug, Clone, Error)]
pub enum ConversionError {
    /// The converter is not installed or could not be launched.
    #[error("converter unavailable: {detail}")]
    Unavailable { detail: String, hint: String },

    /// The converter ran and did not produce a PDF.
    #[error("conversion failed: {detail}")]
    Failed { detail: String },
}

/// Text generation, optionally grounded in live search results.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ServiceError>;
}

/// Vision captioning of a single image.
#[async_trait]
pub trait CaptionService: Send + Sync {
    async fn caption(
        &self,
        model: &str,
        image: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<String, ServiceError>;

    /// The model that actually serves a request for `requested`. Caption
    /// cache keys are built from it.
    fn caption_model(&self, requested: &str) -> String {
        requested.to_string()
    }
}

/// Conversion of an office or image document into PDF bytes.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert_to_pdf(
        &self,
        bytes: &[u8],
        media_type: &MediaType,
    ) -> Result<Vec<u8>, ConversionError>;
}

/// Map a reqwest failure to a service error class.
pub(crate) fn classify_reqwest(e: &reqwest::Error) -> ServiceError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ServiceError::Transient {
            detail: e.to_string(),
        }
    } else {
        ServiceError::Permanent {
            detail: e.to_string(),
        }
    }
}

//! Error types for the gemini-search-mcp library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocQaError`] is **fatal**: the request cannot produce an answer
//!   (unsupported format, corrupt PDF, synthesis call failed, deadline hit).
//!   Returned as `Err(DocQaError)` from the orchestrator and the dispatcher,
//!   and rendered to the client with a stable [`DocQaError::code`].
//!
//! * [`CaptionError`] is **non-fatal**: a single image could not be captioned
//!   but the rest of the document is fine. Stored in
//!   [`crate::pipeline::enrich::EnrichmentReport`]; the image slot receives the
//!   placeholder caption and the pipeline carries on.

use crate::cache::CacheScope;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage names, used in timeout and progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Extract,
    Enrich,
    Synthesize,
    Search,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Extract => "extract",
            Stage::Enrich => "enrich",
            Stage::Synthesize => "synthesize",
            Stage::Search => "search",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All fatal errors returned by the gemini-search-mcp library.
#[derive(Debug, Error)]
pub enum DocQaError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Document file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    DocumentNotFound { path: PathBuf },

    /// Process does not have read permission on the document.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The media type is not one the normalizer knows how to handle.
    #[error("Unsupported document format '{media_type}'")]
    UnsupportedFormat { media_type: String },

    // ── Normalization errors ──────────────────────────────────────────────
    /// The external converter is not installed or could not be started.
    #[error("Document conversion is unavailable: {detail}\n{hint}")]
    ConversionUnavailable { detail: String, hint: String },

    /// The converter ran but could not produce a PDF.
    #[error("Document conversion failed after {attempts} attempt(s): {detail}")]
    ConversionFailed { attempts: u32, detail: String },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// PDF is corrupt, encrypted, or pdfium could not be loaded.
    #[error("Markdown extraction failed: {detail}")]
    ExtractionFailed { detail: String },

    // ── Generation errors ─────────────────────────────────────────────────
    /// The answer generation call failed.
    #[error("Answer synthesis failed: {detail}")]
    SynthesisFailed { detail: String },

    /// The grounded web search call failed.
    #[error("Web search failed: {detail}")]
    SearchFailed { detail: String },

    /// No generation backend could be configured.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Request lifecycle ─────────────────────────────────────────────────
    /// The request deadline expired before `stage` could finish.
    #[error("Request timed out after {secs}s during the {stage} stage")]
    Timeout { stage: Stage, secs: u64 },

    /// The caller cancelled the request or disconnected.
    #[error("Request was cancelled")]
    Cancelled,

    /// Malformed tool call: unknown tool or missing/invalid parameter.
    #[error("Invalid request: {0}")]
    Validation(String),

    // ── Cache errors ──────────────────────────────────────────────────────
    /// A different payload was written under an existing key.
    #[error("Cache corruption: key {key} in scope '{scope}' already holds a different payload")]
    CacheCorruption { key: String, scope: CacheScope },

    /// Reading or writing the cache directory failed.
    #[error("Cache I/O error at '{path}': {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocQaError {
    /// Stable machine-readable code reported to tool clients.
    pub fn code(&self) -> &'static str {
        match self {
            DocQaError::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            DocQaError::PermissionDenied { .. } => "PERMISSION_DENIED",
            DocQaError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            DocQaError::ConversionUnavailable { .. } => "CONVERSION_UNAVAILABLE",
            DocQaError::ConversionFailed { .. } => "CONVERSION_FAILED",
            DocQaError::ExtractionFailed { .. } => "EXTRACTION_FAILED",
            DocQaError::SynthesisFailed { .. } => "SYNTHESIS_FAILED",
            DocQaError::SearchFailed { .. } => "SEARCH_FAILED",
            DocQaError::ProviderNotConfigured { .. } => "PROVIDER_NOT_CONFIGURED",
            DocQaError::Timeout { .. } => "TIMEOUT",
            DocQaError::Cancelled => "CANCELLED",
            DocQaError::Validation(_) => "VALIDATION_ERROR",
            DocQaError::CacheCorruption { .. } => "CACHE_CORRUPTION",
            DocQaError::CacheIo { .. } => "CACHE_IO",
            DocQaError::InvalidConfig(_) => "INVALID_CONFIG",
            DocQaError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller can reasonably fix the condition and try again
    /// (install a converter, wait out a timeout).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DocQaError::ConversionUnavailable { .. }
                | DocQaError::Timeout { .. }
                | DocQaError::ProviderNotConfigured { .. }
        )
    }

    pub(crate) fn cache_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DocQaError::CacheIo {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal captioning failure for a single image.
///
/// Reported under the `CAPTIONING_DEGRADED` code; the image slot receives
/// [`crate::prompts::PLACEHOLDER_CAPTION`].
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum CaptionError {
    /// Every retry failed with a transient error.
    #[error("Image {index}: captioning failed after {attempts} attempt(s): {detail}")]
    Exhausted {
        index: usize,
        attempts: u32,
        detail: String,
    },

    /// The service rejected the image outright; retrying would not help.
    #[error("Image {index}: captioning rejected: {detail}")]
    Rejected { index: usize, detail: String },

    /// The enrichment budget ran out before this image resolved.
    #[error("Image {index}: captioning did not finish before the deadline")]
    TimedOut { index: usize },

    /// The request was cancelled before this image was attempted.
    #[error("Image {index}: captioning skipped after cancellation")]
    Cancelled { index: usize },
}

impl CaptionError {
    pub const CODE: &'static str = "CAPTIONING_DEGRADED";

    pub fn index(&self) -> usize {
        match self {
            CaptionError::Exhausted { index, .. }
            | CaptionError::Rejected { index, .. }
            | CaptionError::TimedOut { index }
            | CaptionError::Cancelled { index } => *index,
        }
    }
}

//! Progress-observer trait for pipeline events.
//!
//! Inject an [`Arc<dyn ProgressObserver>`] per request to receive events as
//! the pipeline moves through its stages. The tool server forwards them to
//! the client as log notifications; tests count them.
//!
//! Captioning runs concurrently, so `on_caption_complete` and
//! `on_caption_error` may be called from several tasks at once.
//! Implementations must be `Send + Sync` and protect shared state
//! accordingly. Every method has a no-op default.

use crate::error::{CaptionError, Stage};
use std::sync::Arc;

pub trait ProgressObserver: Send + Sync {
    /// A stage is about to run (or be served from cache).
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// A stage finished. `cached` is true when its output came from the cache.
    fn on_stage_complete(&self, stage: Stage, cached: bool) {
        let _ = (stage, cached);
    }

    /// Extraction found `total` image tags, `unique` distinct images.
    fn on_images_found(&self, total: usize, unique: usize) {
        let _ = (total, unique);
    }

    /// One distinct image received its caption.
    fn on_caption_complete(&self, index: usize, unique_total: usize, cached: bool) {
        let _ = (index, unique_total, cached);
    }

    /// One distinct image will carry the placeholder.
    fn on_caption_error(&self, error: &CaptionError) {
        let _ = error;
    }
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

pub type SharedObserver = Arc<dyn ProgressObserver>;

/// Human-readable line for a stage start, as shown to tool clients.
pub fn describe_stage(stage: Stage) -> &'static str {
    match stage {
        Stage::Normalize => "Converting the document to PDF",
        Stage::Extract => "Extracting text and images",
        Stage::Enrich => "Captioning embedded images",
        Stage::Synthesize => "Generating the answer",
        Stage::Search => "Searching the web",
    }
}

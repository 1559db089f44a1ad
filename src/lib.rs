//! # gemini-search-mcp
//!
//! An MCP server that gives CLI assistants two tools: Google-grounded web
//! search and question answering over a single document.
//!
//! ## Why a pipeline?
//!
//! Models answer best from text, but real documents are Word files, slide
//! decks and scanned charts. Every document is therefore normalised to PDF,
//! flattened to Markdown, and its figures are described by a vision model
//! before the question is asked. Each step is content-addressed and cached,
//! so asking a second question about the same file costs one model call.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document (path or base64)
//!  │
//!  ├─ 1. Normalize   any supported format → PDF (LibreOffice headless)
//!  ├─ 2. Extract     PDF → Markdown + ordered images (pdfium, spawn_blocking)
//!  ├─ 3. Enrich      concurrent image captions, rewritten in document order
//!  └─ 4. Synthesize  low-temperature answer over the captioned Markdown
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gemini_search_mcp::{
//!     orchestrator::{PipelineRequest, RunContext},
//!     pipeline::document::Document,
//!     Dispatcher, ServerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads nothing from the environment; pass the key explicitly.
//!     let config = ServerConfig::builder()
//!         .api_key(std::env::var("GEMINI_API_KEY")?)
//!         .build()?;
//!     let dispatcher = Dispatcher::from_config(&config).await?;
//!
//!     let doc = Document::load("report.pdf", None).await?;
//!     let ctx = RunContext::new(config.request_timeout());
//!     let output = dispatcher
//!         .pipeline()
//!         .run(PipelineRequest::new(doc, "What happened to revenue?"), &ctx)
//!         .await?;
//!     println!("{}", output.answer);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `gemini-search-mcp` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod error;
pub mod mcp;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod search;
pub mod services;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheScope, ClearScope, ContentCache, StageKey};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{CaptionError, DocQaError, Stage};
pub use mcp::{Dispatcher, McpServer, ToolName};
pub use orchestrator::{
    Collaborators, Pipeline, PipelineOutput, PipelineRequest, PipelineState, RunContext,
    RunReport,
};
pub use progress::{NoopObserver, ProgressObserver};
pub use search::WebSearch;

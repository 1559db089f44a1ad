//! CLI binary for gemini-search-mcp.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ServerConfig`, then serves MCP over stdio. Logs go to stderr because
//! stdout carries the protocol.

use anyhow::{Context, Result};
use clap::Parser;
use gemini_search_mcp::cache::{CacheScope, ClearScope, ContentCache};
use gemini_search_mcp::{Dispatcher, McpServer, ServerConfig};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Register with a CLI assistant (stdio transport)
  gemini-search-mcp

  # Use a different vision model for figure captions
  gemini-search-mcp --vision-model gemini-2.5-flash

  # Drop every cached caption, keep converted PDFs and Markdown
  gemini-search-mcp --clear-cache caption

TOOLS:
  web_search                    Google-grounded web search via Gemini
  document_question_answering   Ask a question about a PDF, Office, HWP or image file

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (required for web_search)
  GEMINI_SEARCH_CACHE_DIR Cache root (default: ~/.cache/gemini-search-mcp)
  EDGEQUAKE_LLM_PROVIDER  Fallback provider when no Gemini key is set
  EDGEQUAKE_MODEL         Fallback provider model
  PDFIUM_LIB_PATH         Path to an existing libpdfium (skips auto-download)
  RUST_LOG                Log filter, overrides --verbose/--quiet

REQUIREMENTS:
  Office and HWP documents are converted with LibreOffice (`soffice`).
  PDFium (~30 MB) is downloaded automatically on first run.
"#;

/// MCP server exposing grounded web search and document question answering.
#[derive(Parser, Debug)]
#[command(
    name = "gemini-search-mcp",
    version,
    about = "MCP server: Gemini web search and document question answering",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Gemini API key. Without it an edgequake-llm provider is auto-detected.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Gemini REST endpoint.
    #[arg(long, env = "GEMINI_API_BASE_URL")]
    api_base_url: Option<String>,

    /// Fallback provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model for the fallback provider.
    #[arg(long, env = "GEMINI_SEARCH_PROVIDER_MODEL")]
    provider_model: Option<String>,

    /// Model used by web_search.
    #[arg(long, env = "GEMINI_SEARCH_MODEL")]
    search_model: Option<String>,

    /// Model that answers document questions.
    #[arg(long, env = "GEMINI_ANSWER_MODEL")]
    answer_model: Option<String>,

    /// Vision model that captions embedded images.
    #[arg(long, env = "GEMINI_VISION_MODEL")]
    vision_model: Option<String>,

    /// Answer temperature (0.0–2.0).
    #[arg(long, env = "GEMINI_SEARCH_TEMPERATURE")]
    temperature: Option<f32>,

    /// Max output tokens per answer.
    #[arg(long, env = "GEMINI_SEARCH_MAX_TOKENS")]
    max_tokens: Option<usize>,

    /// Path to a text file with a custom caption prompt.
    #[arg(long, env = "GEMINI_SEARCH_CAPTION_PROMPT")]
    caption_prompt: Option<PathBuf>,

    /// Concurrent caption calls per document.
    #[arg(long, env = "GEMINI_SEARCH_CAPTION_CONCURRENCY")]
    caption_concurrency: Option<usize>,

    /// Concurrent tool calls.
    #[arg(short, long, env = "GEMINI_SEARCH_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Overall budget per tool call, in seconds.
    #[arg(long, env = "GEMINI_SEARCH_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Budget for captioning one document, in seconds.
    #[arg(long, env = "GEMINI_SEARCH_ENRICH_TIMEOUT")]
    enrich_timeout: Option<u64>,

    /// Timeout of a single API call, in seconds.
    #[arg(long, env = "GEMINI_SEARCH_API_TIMEOUT")]
    api_timeout: Option<u64>,

    /// Retries per caption on transient failure.
    #[arg(long, env = "GEMINI_SEARCH_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// LibreOffice executable.
    #[arg(long, env = "GEMINI_SEARCH_SOFFICE")]
    soffice: Option<String>,

    /// Timeout of one document conversion, in seconds.
    #[arg(long, env = "GEMINI_SEARCH_CONVERSION_TIMEOUT")]
    conversion_timeout: Option<u64>,

    /// Cache root directory.
    #[arg(long, env = "GEMINI_SEARCH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Cache size bound in MiB.
    #[arg(long, env = "GEMINI_SEARCH_CACHE_MAX_MB", conflicts_with = "no_cache_limit")]
    cache_max_mb: Option<u64>,

    /// Never evict cache entries.
    #[arg(long)]
    no_cache_limit: bool,

    /// Cache answers keyed by the question text.
    #[arg(long, env = "GEMINI_SEARCH_CACHE_ANSWERS")]
    cache_answers: bool,

    /// Skip embedded images smaller than this many pixels per side.
    #[arg(long, env = "GEMINI_SEARCH_MIN_IMAGE_SIDE")]
    min_image_side: Option<u32>,

    /// Password for encrypted PDFs.
    #[arg(long, env = "GEMINI_SEARCH_PDF_PASSWORD", hide_env_values = true)]
    pdf_password: Option<String>,

    /// Clear the cache (all, normalize, extract, enrich, caption, answer) and exit.
    #[arg(long, value_name = "SCOPE", num_args = 0..=1, default_missing_value = "all")]
    clear_cache: Option<String>,

    /// Print cache usage and exit.
    #[arg(long)]
    cache_stats: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "GEMINI_SEARCH_VERBOSE")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, env = "GEMINI_SEARCH_QUIET")]
    quiet: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let mut b = ServerConfig::builder();
        if let Some(v) = self.api_key {
            b = b.api_key(v);
        }
        if let Some(v) = self.api_base_url {
            b = b.api_base_url(v);
        }
        if let Some(v) = self.provider {
            b = b.provider_name(v);
        }
        if let Some(v) = self.provider_model {
            b = b.provider_model(v);
        }
        if let Some(v) = self.search_model {
            b = b.search_model(v);
        }
        if let Some(v) = self.answer_model {
            b = b.answer_model(v);
        }
        if let Some(v) = self.vision_model {
            b = b.vision_model(v);
        }
        if let Some(v) = self.temperature {
            b = b.temperature(v);
        }
        if let Some(v) = self.max_tokens {
            b = b.max_output_tokens(v);
        }
        if let Some(path) = self.caption_prompt {
            let prompt = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read caption prompt {}", path.display()))?;
            b = b.caption_prompt(prompt);
        }
        if let Some(v) = self.caption_concurrency {
            b = b.caption_concurrency(v);
        }
        if let Some(v) = self.concurrency {
            b = b.request_concurrency(v);
        }
        if let Some(v) = self.request_timeout {
            b = b.request_timeout_secs(v);
        }
        if let Some(v) = self.enrich_timeout {
            b = b.enrich_timeout_secs(v);
        }
        if let Some(v) = self.api_timeout {
            b = b.api_timeout_secs(v);
        }
        if let Some(v) = self.max_retries {
            b = b.max_retries(v);
        }
        if let Some(v) = self.soffice {
            b = b.converter_program(v);
        }
        if let Some(v) = self.conversion_timeout {
            b = b.conversion_timeout_secs(v);
        }
        if let Some(v) = self.cache_dir {
            b = b.cache_dir(v);
        }
        if self.no_cache_limit {
            b = b.cache_max_bytes(None);
        } else if let Some(mb) = self.cache_max_mb {
            b = b.cache_max_bytes(Some(mb.saturating_mul(1024 * 1024)));
        }
        if self.cache_answers {
            b = b.cache_answers(true);
        }
        if let Some(v) = self.min_image_side {
            b = b.min_image_side(v);
        }
        if let Some(v) = self.pdf_password {
            b = b.pdf_password(v);
        }
        b.build().context("Invalid configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let clear_cache = cli.clear_cache.clone();
    let cache_stats = cli.cache_stats;
    let config = cli.into_config()?;

    // ── Cache maintenance modes ──────────────────────────────────────────
    if clear_cache.is_some() || cache_stats {
        let cache = ContentCache::open(&config.cache_dir, config.cache_max_bytes)
            .await
            .context("Failed to open the cache")?;
        if let Some(scope) = clear_cache {
            let scope = match scope.as_str() {
                "all" => ClearScope::All,
                other => ClearScope::Only(
                    CacheScope::parse(other)
                        .with_context(|| format!("Unknown cache scope '{other}'"))?,
                ),
            };
            let removed = cache.clear(scope).await.context("Failed to clear the cache")?;
            eprintln!("Removed {removed} cache entries from {}", config.cache_dir.display());
        }
        if cache_stats {
            let stats = cache.stats().await.context("Failed to read cache stats")?;
            eprintln!(
                "{}: {} entries, {:.1} MiB",
                config.cache_dir.display(),
                stats.entries,
                stats.bytes as f64 / (1024.0 * 1024.0)
            );
        }
        return Ok(());
    }

    // ── Ensure PDFium engine is available ───────────────────────────────
    // Fetch it now rather than inside the first tool call's deadline.
    if !pdfium_auto::is_pdfium_cached() {
        info!("Downloading the PDFium engine (first run)");
        if let Err(e) = tokio::task::spawn_blocking(|| pdfium_auto::ensure_pdfium_library(None))
            .await
            .context("PDFium download task failed")?
        {
            warn!("PDFium is unavailable, document questions will fail: {}", e);
        }
    }

    // ── Serve ────────────────────────────────────────────────────────────
    info!("Configuration: {:?}", config);
    let dispatcher = Dispatcher::from_config(&config)
        .await
        .context("Failed to initialise the tool dispatcher")?;
    let server = McpServer::new(Arc::new(dispatcher), config.request_concurrency);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; shutting down");
            shutdown.cancel();
        }
    });

    server.run_stdio().await.context("MCP server failed")?;
    info!("Client disconnected; bye");
    Ok(())
}

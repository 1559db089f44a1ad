//! Deterministic fakes of every collaborator, with call counters.

#![allow(dead_code)]

use async_trait::async_trait;
use gemini_search_mcp::cache::ContentCache;
use gemini_search_mcp::error::DocQaError;
use gemini_search_mcp::orchestrator::{Collaborators, Pipeline};
use gemini_search_mcp::pipeline::document::{CanonicalPdf, MediaType};
use gemini_search_mcp::pipeline::extract::{assemble, Block, ExtractedDocument, Extractor};
use gemini_search_mcp::services::{
    CaptionService, ConversionError, DocumentConverter, Generation, GenerationRequest,
    GenerationService, ServiceError, Source,
};
use gemini_search_mcp::{ServerConfig, ServerConfigBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ── Converter ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeConverter {
    pub calls: AtomicUsize,
    pub unavailable: bool,
    pub delay_ms: u64,
    /// Stamp the call number into the output, so no two runs agree.
    pub drift: bool,
}

#[async_trait]
impl DocumentConverter for FakeConverter {
    async fn convert_to_pdf(
        &self,
        bytes: &[u8],
        media_type: &MediaType,
    ) -> Result<Vec<u8>, ConversionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if self.unavailable {
            return Err(ConversionError::Unavailable {
                detail: "soffice: not found".into(),
                hint: "Install LibreOffice".into(),
            });
        }
        let mut pdf = format!("%PDF-1.7 converted {} ", media_type.extension()).into_bytes();
        if self.drift {
            pdf.extend_from_slice(format!("build {call} ").as_bytes());
        }
        pdf.extend_from_slice(bytes);
        Ok(pdf)
    }
}

// ── Extractor ────────────────────────────────────────────────────────────

/// Returns the same page blocks for any PDF.
pub struct FakeExtractor {
    pub calls: AtomicUsize,
    pages: Vec<Vec<Block>>,
    fail: bool,
}

impl FakeExtractor {
    pub fn new(pages: Vec<Vec<Block>>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            pages,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            pages: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, _pdf: &CanonicalPdf) -> Result<ExtractedDocument, DocQaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DocQaError::ExtractionFailed {
                detail: "password required".into(),
            });
        }
        Ok(assemble(self.pages.clone()))
    }
}

// ── Captioner ────────────────────────────────────────────────────────────

/// Captions image `[n, ..]` as "chart n" after `delays[n]` ms.
#[derive(Default)]
pub struct FakeCaptioner {
    pub calls: AtomicUsize,
    pub delays: HashMap<u8, u64>,
    pub always_failing: HashSet<u8>,
    /// Cancelled on the first call.
    pub cancel_on_call: Option<CancellationToken>,
}

#[async_trait]
impl CaptionService for FakeCaptioner {
    async fn caption(
        &self,
        _model: &str,
        image: &[u8],
        _mime: &str,
        _prompt: &str,
    ) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        let id = image[0];
        if let Some(ms) = self.delays.get(&id) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if self.always_failing.contains(&id) {
            return Err(ServiceError::RateLimited { retry_after: None });
        }
        Ok(format!("chart {id}"))
    }
}

// ── Generator ────────────────────────────────────────────────────────────

/// Answers from the prompt: reports the first percentage it finds.
#[derive(Default)]
pub struct FakeGenerator {
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub fail: bool,
    pub delay_ms: u64,
}

impl FakeGenerator {
    pub fn last_prompt(&self) -> String {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl GenerationService for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail {
            return Err(ServiceError::Permanent {
                detail: "400 invalid argument".into(),
            });
        }
        if request.grounded {
            return Ok(Generation {
                text: format!("Results for {}", request.prompt),
                sources: vec![Source {
                    title: "Example".into(),
                    uri: "https://example.com/".into(),
                }],
            });
        }
        let percent = request
            .prompt
            .split_whitespace()
            .find(|w| w.ends_with('%'))
            .unwrap_or("no figure");
        Ok(Generation {
            text: format!("According to the document, revenue rose {percent}."),
            sources: Vec::new(),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

/// Route pipeline logs to the test output; `RUST_LOG=debug` for detail.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub dir: TempDir,
    pub cache: Arc<ContentCache>,
    pub converter: Arc<FakeConverter>,
    pub extractor: Arc<FakeExtractor>,
    pub captioner: Arc<FakeCaptioner>,
    pub generator: Arc<FakeGenerator>,
    pub pipeline: Arc<Pipeline>,
    pub config: ServerConfig,
}

pub fn base_config(dir: &TempDir) -> ServerConfigBuilder {
    ServerConfig::builder()
        .cache_dir(dir.path())
        .cache_max_bytes(None)
        .caption_concurrency(4)
        .max_retries(2)
        .retry_backoff_ms(1)
        .conversion_attempts(3)
}

impl Harness {
    pub async fn new(
        pages: Vec<Vec<Block>>,
        captioner: FakeCaptioner,
        configure: impl FnOnce(ServerConfigBuilder) -> ServerConfigBuilder,
    ) -> Self {
        Self::with_parts(
            FakeConverter::default(),
            FakeExtractor::new(pages),
            captioner,
            FakeGenerator::default(),
            configure,
        )
        .await
    }

    pub async fn with_parts(
        converter: FakeConverter,
        extractor: FakeExtractor,
        captioner: FakeCaptioner,
        generator: FakeGenerator,
        configure: impl FnOnce(ServerConfigBuilder) -> ServerConfigBuilder,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let config = configure(base_config(&dir)).build().unwrap();
        let cache = Arc::new(
            ContentCache::open(&config.cache_dir, config.cache_max_bytes)
                .await
                .unwrap(),
        );
        let converter = Arc::new(converter);
        let extractor = Arc::new(extractor);
        let captioner = Arc::new(captioner);
        let generator = Arc::new(generator);
        let services = Collaborators {
            generator: generator.clone(),
            captioner: captioner.clone(),
            converter: converter.clone(),
            extractor: extractor.clone(),
        };
        let pipeline = Arc::new(Pipeline::new(&config, cache.clone(), services));
        Self {
            dir,
            cache,
            converter,
            extractor,
            captioner,
            generator,
            pipeline,
            config,
        }
    }

    pub async fn entries(&self) -> usize {
        self.cache.stats().await.unwrap().entries
    }
}

/// One page: "Q3 revenue rose 12%" followed by a chart.
pub fn revenue_report() -> Vec<Vec<Block>> {
    vec![vec![
        Block::Text("Quarterly report".into()),
        Block::Text("Q3 revenue rose 12%".into()),
        Block::Image(vec![1, 0, 0, 0]),
    ]]
}

/// Ten blocks; images sit at the given positions, tagged with their position.
pub fn blocks_with_images_at(positions: &[u8]) -> Vec<Vec<Block>> {
    let blocks = (0u8..10)
        .map(|i| {
            if positions.contains(&i) {
                Block::Image(vec![i])
            } else {
                Block::Text(format!("paragraph {i}"))
            }
        })
        .collect();
    vec![blocks]
}

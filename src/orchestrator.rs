//! Per-request pipeline orchestration.
//!
//! ## State machine
//!
//! ```text
//! Received ─▶ Normalizing ─▶ Extracting ─▶ Enriching ─▶ Synthesizing ─▶ Completed
//!     │            │              │             │              │
//!     └────────────┴──────────────┴─────────────┴──────────────┴──▶ Failed(code)
//! ```
//!
//! Before each stage the orchestrator checks the cancel token and the request
//! deadline, computes the stage's [`StageKey`] and consults the cache. A hit
//! feeds the cached payload to the next stage; a miss runs the stage and
//! stores its output first.
//!
//! ## Stage keys
//!
//! | Stage     | Input hash               | Parameters                      |
//! |-----------|--------------------------|---------------------------------|
//! | normalize | document bytes           | media type                      |
//! | extract   | canonical PDF            | min image side, payload version |
//! | enrich    | extract payload          | vision model, prompt hash       |
//! | answer    | captioned Markdown       | question hash, model, temperature |
//!
//! Answers are only cached when `cache_answers` is on. The enrich output is
//! only cached when every image received a real caption.
//!
//! Each stage holds its key's cache claim from lookup to store, so identical
//! concurrent requests compute a stage once and the others hit the cache.
//! Claims are taken stage by stage and a run holds at most one stage claim
//! at a time, plus caption claims while enriching.

use crate::cache::{content_hash, CacheScope, Claim, ContentCache, StageKey};
use crate::config::ServerConfig;
use crate::error::{DocQaError, Stage};
use crate::pipeline::document::{CanonicalPdf, Document};
use crate::pipeline::enrich::{CaptionEnricher, EnrichSettings, EnrichmentReport};
use crate::pipeline::extract::{ExtractedDocument, Extractor, PdfiumExtractor};
use crate::pipeline::normalize::Normalizer;
use crate::pipeline::synthesize::{AnswerSynthesizer, SynthesisSettings};
use crate::progress::{NoopObserver, SharedObserver};
use crate::services::{
    CaptionService, DocumentConverter, GeminiClient, GenerationService, ProviderService,
    SofficeConverter,
};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bumped whenever the extract payload layout changes.
const EXTRACT_PAYLOAD_VERSION: &str = "1";

// ── Request types ────────────────────────────────────────────────────────

/// Per-request replacements for configured stage parameters.
#[derive(Debug, Clone, Default)]
pub struct StageOverrides {
    pub answer_model: Option<String>,
    pub vision_model: Option<String>,
    pub temperature: Option<f32>,
}

/// One document question. Lives only as long as the request.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub document: Document,
    pub question: String,
    pub overrides: StageOverrides,
}

impl PipelineRequest {
    pub fn new(document: Document, question: impl Into<String>) -> Self {
        Self {
            document,
            question: question.into(),
            overrides: StageOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: StageOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Lifecycle of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Normalizing,
    Extracting,
    Enriching,
    Synthesizing,
    Completed,
    /// Carries the error code.
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Failed(code) => write!(f, "failed({code})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

// ── Run context ──────────────────────────────────────────────────────────

/// Deadline, cancel signal and observer shared by every stage of one run.
#[derive(Clone)]
pub struct RunContext {
    deadline: Instant,
    budget: Duration,
    cancel: CancellationToken,
    observer: SharedObserver,
}

impl RunContext {
    /// A context whose deadline is `budget` from now.
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            budget,
            cancel: CancellationToken::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn observer(&self) -> &SharedObserver {
        &self.observer
    }

    fn timeout_error(&self, stage: Stage) -> DocQaError {
        DocQaError::Timeout {
            stage,
            secs: self.budget.as_secs(),
        }
    }

    /// Fail fast if the request was cancelled or ran out of time.
    pub fn checkpoint(&self, stage: Stage) -> Result<(), DocQaError> {
        if self.cancel.is_cancelled() {
            return Err(DocQaError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(self.timeout_error(stage));
        }
        Ok(())
    }

    /// Run `fut`, abandoning it on cancellation or at the deadline.
    pub async fn bounded<T, F>(&self, stage: Stage, fut: F) -> Result<T, DocQaError>
    where
        F: Future<Output = Result<T, DocQaError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DocQaError::Cancelled),
            outcome = timeout_at(self.deadline, fut) => {
                outcome.unwrap_or_else(|_| Err(self.timeout_error(stage)))
            }
        }
    }
}

// ── Output ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub cached: bool,
    pub elapsed_ms: u64,
}

/// What a completed run did, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source: String,
    pub media_type: String,
    pub page_count: usize,
    pub stages: Vec<StageRecord>,
    pub enrichment: EnrichmentReport,
}

impl RunReport {
    /// Stages served from the cache.
    pub fn cache_hits(&self) -> usize {
        self.stages.iter().filter(|s| s.cached).count()
    }

    fn record(&mut self, stage: Stage, cached: bool, started: std::time::Instant) {
        self.stages.push(StageRecord {
            stage,
            cached,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub answer: String,
    pub report: RunReport,
}

// ── Collaborators ────────────────────────────────────────────────────────

/// The external capabilities a [`Pipeline`] drives.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn GenerationService>,
    pub captioner: Arc<dyn CaptionService>,
    pub converter: Arc<dyn DocumentConverter>,
    pub extractor: Arc<dyn Extractor>,
}

impl Collaborators {
    /// Production wiring: the Gemini REST client when an API key is
    /// configured, otherwise an auto-detected edgequake-llm provider.
    pub fn from_config(config: &ServerConfig) -> Result<Self, DocQaError> {
        let (generator, captioner): (Arc<dyn GenerationService>, Arc<dyn CaptionService>) =
            match &config.api_key {
                Some(key) => {
                    let client = GeminiClient::new(
                        key.clone(),
                        config.api_base_url.clone(),
                        config.api_timeout(),
                    )
                    .map_err(|e| DocQaError::InvalidConfig(e.to_string()))?
                    .with_caption_max_tokens(config.caption_max_tokens);
                    info!("Using the Gemini API at {}", config.api_base_url);
                    let client = Arc::new(client);
                    (
                        client.clone() as Arc<dyn GenerationService>,
                        client as Arc<dyn CaptionService>,
                    )
                }
                None => {
                    let service = Arc::new(ProviderService::from_config(config)?);
                    info!("No Gemini API key; using {:?}", service);
                    (
                        service.clone() as Arc<dyn GenerationService>,
                        service as Arc<dyn CaptionService>,
                    )
                }
            };
        Ok(Self {
            generator,
            captioner,
            converter: Arc::new(SofficeConverter::new(
                config.converter_program.clone(),
                config.conversion_timeout(),
            )),
            extractor: Arc::new(PdfiumExtractor::new(
                config.min_image_side,
                config.pdf_password.clone(),
            )),
        })
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Tracks the current state and logs every transition.
struct RunState<'a> {
    source: &'a str,
    state: PipelineState,
}

impl<'a> RunState<'a> {
    fn new(source: &'a str) -> Self {
        debug!("{}: {}", source, PipelineState::Received);
        Self {
            source,
            state: PipelineState::Received,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!("{}: {} → {}", self.source, self.state, next);
        self.state = next;
    }
}

pub struct Pipeline {
    cache: Arc<ContentCache>,
    normalizer: Normalizer,
    extractor: Arc<dyn Extractor>,
    captioner: Arc<dyn CaptionService>,
    generator: Arc<dyn GenerationService>,
    enrich: EnrichSettings,
    synthesis: SynthesisSettings,
    min_image_side: u32,
    enrich_budget: Duration,
    request_timeout: Duration,
    cache_answers: bool,
}

impl Pipeline {
    pub fn new(config: &ServerConfig, cache: Arc<ContentCache>, services: Collaborators) -> Self {
        Self {
            cache,
            normalizer: Normalizer::new(
                services.converter,
                config.conversion_attempts,
                config.retry_backoff_ms,
            ),
            extractor: services.extractor,
            captioner: services.captioner,
            generator: services.generator,
            enrich: EnrichSettings::from_config(config),
            synthesis: SynthesisSettings {
                model: config.answer_model.clone(),
                temperature: config.temperature,
                max_output_tokens: config.max_output_tokens,
            },
            min_image_side: config.min_image_side,
            enrich_budget: config.enrich_timeout(),
            request_timeout: config.request_timeout(),
            cache_answers: config.cache_answers,
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn generator(&self) -> &Arc<dyn GenerationService> {
        &self.generator
    }

    /// Overall budget given to each request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Answer `request.question` against `request.document`.
    pub async fn run(
        &self,
        request: PipelineRequest,
        ctx: &RunContext,
    ) -> Result<PipelineOutput, DocQaError> {
        let mut run = RunState::new(&request.document.source);
        let result = self.run_stages(&request, ctx, &mut run).await;
        match &result {
            Ok(output) => {
                run.advance(PipelineState::Completed);
                info!(
                    "{}: answered ({} of {} stages cached)",
                    request.document.source,
                    output.report.cache_hits(),
                    output.report.stages.len()
                );
            }
            Err(e) => {
                warn!("{}: failed during {}: {}", request.document.source, run.state, e);
                run.advance(PipelineState::Failed(e.code().to_string()));
            }
        }
        result
    }

    async fn run_stages(
        &self,
        request: &PipelineRequest,
        ctx: &RunContext,
        run: &mut RunState<'_>,
    ) -> Result<PipelineOutput, DocQaError> {
        let doc = &request.document;
        let overrides = &request.overrides;

        // Unsupported formats never reach the cache or any collaborator.
        if !doc.media_type.is_supported() {
            return Err(DocQaError::UnsupportedFormat {
                media_type: doc.media_type.to_string(),
            });
        }

        let mut report = RunReport {
            source: doc.source.clone(),
            media_type: doc.media_type.to_string(),
            page_count: 0,
            stages: Vec::with_capacity(4),
            enrichment: EnrichmentReport::default(),
        };

        // ── Step 1: Normalize ────────────────────────────────────────────
        run.advance(PipelineState::Normalizing);
        let started = self.begin(ctx, Stage::Normalize)?;
        let key = StageKey::builder(CacheScope::Normalize, doc.content_hash())
            .param("media_type", doc.media_type.mime())
            .build();
        let claim = self.claim(ctx, Stage::Normalize, &key).await?;
        let (pdf_bytes, cached) = match self.lookup(&key).await? {
            Some(bytes) => (bytes, true),
            None => {
                let pdf = ctx
                    .bounded(Stage::Normalize, self.normalizer.normalize(doc))
                    .await?
                    .into_bytes();
                self.store(&key, &pdf, "application/pdf").await?;
                (pdf, false)
            }
        };
        drop(claim);
        let pdf = CanonicalPdf::new(pdf_bytes)
            .ok_or_else(|| DocQaError::Internal("normalize output is not a PDF".into()))?;
        self.finish(ctx, &mut report, Stage::Normalize, started, cached);

        // ── Step 2: Extract ──────────────────────────────────────────────
        run.advance(PipelineState::Extracting);
        let started = self.begin(ctx, Stage::Extract)?;
        let key = StageKey::builder(CacheScope::Extract, pdf.content_hash())
            .param("min_image_side", self.min_image_side)
            .param("payload", EXTRACT_PAYLOAD_VERSION)
            .build();
        let claim = self.claim(ctx, Stage::Extract, &key).await?;
        let (extract_payload, cached) = match self.lookup(&key).await? {
            Some(bytes) => (bytes, true),
            None => {
                let extracted = ctx
                    .bounded(Stage::Extract, self.extractor.extract(&pdf))
                    .await?
                    .to_json()?;
                self.store(&key, &extracted, "application/json").await?;
                (extracted, false)
            }
        };
        drop(claim);
        let extracted = ExtractedDocument::from_json(&extract_payload)?;
        report.page_count = extracted.page_count;
        self.finish(ctx, &mut report, Stage::Extract, started, cached);

        // ── Step 3: Enrich ───────────────────────────────────────────────
        run.advance(PipelineState::Enriching);
        let started = self.begin(ctx, Stage::Enrich)?;
        let mut settings = self.enrich.clone();
        if let Some(model) = &overrides.vision_model {
            settings.model = model.clone();
        }
        let key = StageKey::builder(CacheScope::Enrich, content_hash(&extract_payload))
            .param("model", self.captioner.caption_model(&settings.model))
            .param("prompt", settings.prompt_fingerprint())
            .build();
        let claim = self.claim(ctx, Stage::Enrich, &key).await?;
        let (markdown, cached) = match self.lookup(&key).await? {
            Some(bytes) => {
                report.enrichment.total_images = extracted.images.len();
                let markdown = String::from_utf8(bytes).map_err(|e| {
                    DocQaError::Internal(format!("cached enrich payload is not UTF-8: {e}"))
                })?;
                (markdown, true)
            }
            None => {
                let enricher =
                    CaptionEnricher::new(self.captioner.clone(), self.cache.clone(), settings);
                let deadline = (Instant::now() + self.enrich_budget).min(ctx.deadline());
                let enrichment = enricher
                    .enrich(&extracted, deadline, ctx.cancel_token(), ctx.observer().as_ref())
                    .await?;
                if !enrichment.report.is_degraded() {
                    self.store(&key, enrichment.markdown.as_bytes(), "text/markdown")
                        .await?;
                }
                report.enrichment = enrichment.report;
                (enrichment.markdown, false)
            }
        };
        drop(claim);
        self.finish(ctx, &mut report, Stage::Enrich, started, cached);

        // ── Step 4: Synthesize ───────────────────────────────────────────
        run.advance(PipelineState::Synthesizing);
        let started = self.begin(ctx, Stage::Synthesize)?;
        let mut settings = self.synthesis.clone();
        if let Some(model) = &overrides.answer_model {
            settings.model = model.clone();
        }
        if let Some(t) = overrides.temperature {
            settings.temperature = t.clamp(0.0, 2.0);
        }
        let answer_key = self.cache_answers.then(|| {
            StageKey::builder(CacheScope::Answer, content_hash(markdown.as_bytes()))
                .param("question", content_hash(request.question.trim().as_bytes()))
                .param("model", &settings.model)
                .param("temperature", settings.temperature)
                .build()
        });
        let claim = match &answer_key {
            Some(key) => Some(self.claim(ctx, Stage::Synthesize, key).await?),
            None => None,
        };
        let cached_answer = match &answer_key {
            Some(key) => self.lookup(key).await?,
            None => None,
        };
        let (answer, cached) = match cached_answer {
            Some(bytes) => (
                String::from_utf8(bytes).map_err(|e| {
                    DocQaError::Internal(format!("cached answer is not UTF-8: {e}"))
                })?,
                true,
            ),
            None => {
                let synthesizer = AnswerSynthesizer::new(self.generator.clone(), settings);
                let answer = ctx
                    .bounded(
                        Stage::Synthesize,
                        synthesizer.answer(&markdown, &request.question),
                    )
                    .await?;
                if let Some(key) = &answer_key {
                    self.store(key, answer.as_bytes(), "text/plain; charset=utf-8")
                        .await?;
                }
                (answer, false)
            }
        };
        drop(claim);
        self.finish(ctx, &mut report, Stage::Synthesize, started, cached);

        Ok(PipelineOutput { answer, report })
    }

    fn begin(&self, ctx: &RunContext, stage: Stage) -> Result<std::time::Instant, DocQaError> {
        ctx.checkpoint(stage)?;
        ctx.observer().on_stage_start(stage);
        Ok(std::time::Instant::now())
    }

    fn finish(
        &self,
        ctx: &RunContext,
        report: &mut RunReport,
        stage: Stage,
        started: std::time::Instant,
        cached: bool,
    ) {
        report.record(stage, cached, started);
        ctx.observer().on_stage_complete(stage, cached);
        info!(
            "Stage {} {} in {}ms",
            stage,
            if cached { "served from cache" } else { "done" },
            started.elapsed().as_millis()
        );
    }

    async fn lookup(&self, key: &StageKey) -> Result<Option<Vec<u8>>, DocQaError> {
        let entry = self.cache.get(key).await?;
        if let Some(entry) = &entry {
            debug!("Cache hit {} ({} bytes)", key, entry.metadata.size);
        }
        Ok(entry.map(|e| e.payload))
    }

    /// Wait for exclusive use of `key`, giving up on cancel or deadline.
    async fn claim(
        &self,
        ctx: &RunContext,
        stage: Stage,
        key: &StageKey,
    ) -> Result<Claim, DocQaError> {
        ctx.bounded(stage, async { Ok(self.cache.claim(key).await) })
            .await
    }

    /// Write a stage output. A different payload already stored under `key`
    /// surfaces as [`DocQaError::CacheCorruption`].
    async fn store(
        &self,
        key: &StageKey,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), DocQaError> {
        self.cache.put(key, payload, content_type).await?;
        Ok(())
    }
}

//! Caption enrichment: replace every image tag with a caption.
//!
//! ## Flow
//!
//! 1. Group images by content hash; identical images are captioned once.
//! 2. For each distinct image, look up its caption key in the cache; on a
//!    miss call the [`CaptionService`] with retry and exponential backoff.
//! 3. Up to `concurrency` captions resolve at once (`buffer_unordered`),
//!    completing in any order.
//! 4. Once all resolve, or the deadline passes, the Markdown is rewritten in
//!    document order. Unresolved or failed images get the placeholder.
//!
//! ## Retry Strategy
//!
//! Only transient failures (5xx, timeouts, rate limits, empty captions) are
//! retried: `retry_backoff_ms * 2^(attempt-1)`, or longer when the service
//! sent `Retry-After`. A permanent rejection degrades the image immediately.
//!
//! ## Cancellation
//!
//! The token is checked before every call and during backoff. Calls already
//! in flight run to completion, but no new call starts once it fires.
//!
//! ## Concurrent requests
//!
//! Each distinct image holds its caption key's cache claim while it is
//! resolved, so two requests sharing an image make one call between them.
//! A caption cache collision fails the whole enrichment.

use super::extract::ExtractedDocument;
use super::markdown::rewrite_with_captions;
use crate::cache::{content_hash, CacheScope, ContentCache, StageKey};
use crate::config::ServerConfig;
use crate::error::{CaptionError, DocQaError};
use crate::progress::ProgressObserver;
use crate::prompts::{DEFAULT_CAPTION_PROMPT, PLACEHOLDER_CAPTION};
use crate::services::{CaptionService, ServiceError};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs for one enrichment run.
#[derive(Debug, Clone)]
pub struct EnrichSettings {
    pub model: String,
    pub prompt: String,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound on a single caption call.
    pub call_timeout: Duration,
}

impl EnrichSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            model: config.vision_model.clone(),
            prompt: config
                .caption_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_CAPTION_PROMPT.to_string()),
            concurrency: config.caption_concurrency,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            call_timeout: config.api_timeout(),
        }
    }

    /// Content hash of the prompt; part of every caption key.
    pub fn prompt_fingerprint(&self) -> String {
        content_hash(self.prompt.as_bytes())
    }
}

/// What happened to the images of one document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub total_images: usize,
    pub unique_images: usize,
    pub cache_hits: usize,
    pub captioned: usize,
    pub failures: Vec<CaptionError>,
}

impl EnrichmentReport {
    /// At least one image carries the placeholder.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Enrichment {
    pub markdown: String,
    pub report: EnrichmentReport,
}

struct UniqueImage<'a> {
    slot: usize,
    /// Index of the first occurrence; used in reports.
    first_index: usize,
    hash: String,
    mime: &'a str,
    data: &'a [u8],
}

enum Resolved {
    Cached(String),
    Fresh(String),
}

/// Outer error is fatal to the run; inner error degrades one image.
type Resolution = Result<Result<Resolved, CaptionError>, DocQaError>;

pub struct CaptionEnricher {
    captioner: Arc<dyn CaptionService>,
    cache: Arc<ContentCache>,
    settings: EnrichSettings,
}

impl CaptionEnricher {
    pub fn new(
        captioner: Arc<dyn CaptionService>,
        cache: Arc<ContentCache>,
        settings: EnrichSettings,
    ) -> Self {
        Self {
            captioner,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &EnrichSettings {
        &self.settings
    }

    /// Cache key of the caption for an image with content hash `image_hash`.
    pub fn caption_key(&self, image_hash: &str) -> StageKey {
        StageKey::builder(CacheScope::Caption, image_hash)
            .param("model", self.captioner.caption_model(&self.settings.model))
            .param("prompt", self.settings.prompt_fingerprint())
            .build()
    }

    /// Caption every image in `doc` and rewrite its Markdown.
    ///
    /// Never fails because of an individual image; failures are collected in
    /// the report and the slot receives [`PLACEHOLDER_CAPTION`]. Fails with
    /// [`DocQaError::CacheCorruption`] when a fresh caption collides with a
    /// different cached one.
    pub async fn enrich(
        &self,
        doc: &ExtractedDocument,
        deadline: Instant,
        cancel: &CancellationToken,
        observer: &dyn ProgressObserver,
    ) -> Result<Enrichment, DocQaError> {
        let mut report = EnrichmentReport {
            total_images: doc.images.len(),
            ..Default::default()
        };
        if doc.images.is_empty() {
            return Ok(Enrichment {
                markdown: rewrite_with_captions(&doc.markdown, &[]),
                report,
            });
        }

        // ── Group identical images ───────────────────────────────────────
        let mut uniques: Vec<UniqueImage<'_>> = Vec::new();
        let mut slot_of_hash: HashMap<String, usize> = HashMap::new();
        let mut slots: Vec<usize> = Vec::with_capacity(doc.images.len());
        for image in &doc.images {
            let hash = content_hash(&image.data);
            let slot = match slot_of_hash.get(&hash) {
                Some(&slot) => slot,
                None => {
                    let slot = uniques.len();
                    slot_of_hash.insert(hash.clone(), slot);
                    uniques.push(UniqueImage {
                        slot,
                        first_index: image.index,
                        hash,
                        mime: &image.mime,
                        data: &image.data,
                    });
                    slot
                }
            };
            slots.push(slot);
        }
        report.unique_images = uniques.len();
        observer.on_images_found(report.total_images, report.unique_images);
        info!(
            "Enriching {} images ({} distinct) with {}",
            report.total_images, report.unique_images, self.settings.model
        );

        // ── Resolve concurrently, bounded by the deadline ────────────────
        let unique_total = uniques.len();
        let mut results: Vec<Option<Result<Resolved, CaptionError>>> =
            (0..unique_total).map(|_| None).collect();

        let calls: Vec<BoxFuture<'_, (usize, Resolution)>> = uniques
            .iter()
            .map(|u| async move { (u.slot, self.resolve(u, cancel).await) }.boxed())
            .collect();
        let mut pending = stream::iter(calls).buffer_unordered(self.settings.concurrency.max(1));

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((slot, outcome))) => {
                    let outcome = outcome?;
                    let first_index = uniques[slot].first_index;
                    match &outcome {
                        Ok(Resolved::Cached(_)) => {
                            observer.on_caption_complete(first_index, unique_total, true)
                        }
                        Ok(Resolved::Fresh(_)) => {
                            observer.on_caption_complete(first_index, unique_total, false)
                        }
                        Err(e) => observer.on_caption_error(e),
                    }
                    results[slot] = Some(outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Enrichment budget exhausted; unresolved images get the placeholder");
                    break;
                }
            }
        }
        drop(pending);

        // ── Collect in slot order ────────────────────────────────────────
        let mut captions: Vec<Option<String>> = vec![None; unique_total];
        for (u, result) in uniques.iter().zip(results) {
            match result {
                Some(Ok(Resolved::Cached(text))) => {
                    report.cache_hits += 1;
                    captions[u.slot] = Some(text);
                }
                Some(Ok(Resolved::Fresh(text))) => {
                    report.captioned += 1;
                    captions[u.slot] = Some(text);
                }
                Some(Err(e)) => report.failures.push(e),
                None => {
                    let e = CaptionError::TimedOut {
                        index: u.first_index,
                    };
                    observer.on_caption_error(&e);
                    report.failures.push(e);
                }
            }
        }
        report.failures.sort_by_key(|e| e.index());

        // ── Rewrite in document order ────────────────────────────────────
        let replacements: Vec<_> = doc
            .images
            .iter()
            .zip(&slots)
            .map(|(image, &slot)| {
                let caption = captions[slot]
                    .clone()
                    .unwrap_or_else(|| PLACEHOLDER_CAPTION.to_string());
                (image.span.clone(), caption)
            })
            .collect();
        let markdown = rewrite_with_captions(&doc.markdown, &replacements);

        if report.is_degraded() {
            warn!(
                "{} of {} distinct images carry the placeholder caption",
                report.failures.len(),
                report.unique_images
            );
        }
        Ok(Enrichment { markdown, report })
    }

    async fn resolve(&self, image: &UniqueImage<'_>, cancel: &CancellationToken) -> Resolution {
        let index = image.first_index;
        let key = self.caption_key(&image.hash);
        let _claim = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Err(CaptionError::Cancelled { index })),
            claim = self.cache.claim(&key) => claim,
        };

        match self.cache.get(&key).await {
            Ok(Some(entry)) => match String::from_utf8(entry.payload) {
                Ok(text) if !text.trim().is_empty() => {
                    debug!("Image {}: caption cache hit", index);
                    return Ok(Ok(Resolved::Cached(text)));
                }
                _ => warn!("Image {}: ignoring unusable cached caption", index),
            },
            Ok(None) => {}
            Err(e) => warn!("Image {}: caption cache read failed: {}", index, e),
        }

        let caption = match self.call_with_retries(image, cancel).await {
            Ok(caption) => caption,
            Err(e) => return Ok(Err(e)),
        };

        match self
            .cache
            .put(&key, caption.as_bytes(), "text/plain; charset=utf-8")
            .await
        {
            Ok(_) => {}
            Err(e @ DocQaError::CacheCorruption { .. }) => return Err(e),
            Err(e) => warn!("Image {}: caption not cached: {}", index, e),
        }
        Ok(Ok(Resolved::Fresh(caption)))
    }

    async fn call_with_retries(
        &self,
        image: &UniqueImage<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, CaptionError> {
        let index = image.first_index;
        let attempts = self.settings.max_retries + 1;
        let mut last_err = String::new();
        let mut retry_after: Option<Duration> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let mut backoff =
                    Duration::from_millis(self.settings.retry_backoff_ms * 2u64.pow(attempt - 1));
                if let Some(hint) = retry_after.take() {
                    backoff = backoff.max(hint);
                }
                warn!(
                    "Image {}: retry {}/{} after {}ms",
                    index,
                    attempt,
                    self.settings.max_retries,
                    backoff.as_millis()
                );
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(CaptionError::Cancelled { index }),
                }
            }
            if cancel.is_cancelled() {
                return Err(CaptionError::Cancelled { index });
            }

            let call = self.captioner.caption(
                &self.settings.model,
                image.data,
                image.mime,
                &self.settings.prompt,
            );
            let outcome = match timeout(self.settings.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Transient {
                    detail: format!(
                        "no response within {}s",
                        self.settings.call_timeout.as_secs()
                    ),
                }),
            };

            match outcome {
                Ok(text) if !text.trim().is_empty() => return Ok(text.trim().to_string()),
                Ok(_) => last_err = "empty caption".to_string(),
                Err(ServiceError::RateLimited { retry_after: hint }) => {
                    retry_after = hint;
                    last_err = "rate limited".to_string();
                }
                Err(e) if e.is_retryable() => {
                    warn!("Image {}: attempt {} failed: {}", index, attempt + 1, e);
                    last_err = e.to_string();
                }
                Err(e) => {
                    return Err(CaptionError::Rejected {
                        index,
                        detail: e.to_string(),
                    })
                }
            }
        }

        Err(CaptionError::Exhausted {
            index,
            attempts,
            detail: last_err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::{assemble, Block};
    use crate::progress::NoopObserver;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Captions image `[n]` as "caption n" after `delays[n]` ms.
    struct FakeCaptioner {
        calls: AtomicUsize,
        delays: HashMap<u8, u64>,
        transient: Vec<u8>,
        rejected: Vec<u8>,
    }

    impl FakeCaptioner {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delays: HashMap::new(),
                transient: Vec::new(),
                rejected: Vec::new(),
            }
        }
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
            let id = image[0];
            if let Some(ms) = self.delays.get(&id) {
                sleep(Duration::from_millis(*ms)).await;
            }
            if self.transient.contains(&id) {
                return Err(ServiceError::Transient {
                    detail: "503".into(),
                });
            }
            if self.rejected.contains(&id) {
                return Err(ServiceError::Permanent {
                    detail: "400 unsupported image".into(),
                });
            }
            Ok(format!("caption {id}"))
        }
    }

    async fn enricher(fake: Arc<FakeCaptioner>) -> (TempDir, Arc<ContentCache>, CaptionEnricher) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path(), None).await.unwrap());
        let settings = EnrichSettings {
            model: "vision-test".into(),
            prompt: "describe".into(),
            concurrency: 4,
            max_retries: 2,
            retry_backoff_ms: 1,
            call_timeout: Duration::from_secs(5),
        };
        let e = CaptionEnricher::new(fake, cache.clone(), settings);
        (dir, cache, e)
    }

    fn doc(ids: &[u8]) -> ExtractedDocument {
        let mut blocks = vec![Block::Text("start".into())];
        for id in ids {
            blocks.push(Block::Image(vec![*id]));
            blocks.push(Block::Text(format!("after {id}")));
        }
        assemble(vec![blocks])
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn captions_follow_document_order() {
        let mut fake = FakeCaptioner::new();
        fake.delays = HashMap::from([(1, 60), (2, 30), (3, 0)]);
        let (_d, _c, e) = enricher(Arc::new(fake)).await;
        let out = e
            .enrich(&doc(&[1, 2, 3]), far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        let p1 = out.markdown.find("caption 1").unwrap();
        let p2 = out.markdown.find("caption 2").unwrap();
        let p3 = out.markdown.find("caption 3").unwrap();
        assert!(p1 < p2 && p2 < p3, "{}", out.markdown);
        assert!(!out.markdown.contains("!["));
        assert!(!out.report.is_degraded());
    }

    #[tokio::test]
    async fn exhausted_retries_use_placeholder() {
        let mut fake = FakeCaptioner::new();
        fake.transient = vec![2];
        let fake = Arc::new(fake);
        let (_d, _c, e) = enricher(fake.clone()).await;
        let out = e
            .enrich(&doc(&[1, 2, 3]), far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert!(out.markdown.contains(PLACEHOLDER_CAPTION));
        assert!(out.markdown.contains("caption 1") && out.markdown.contains("caption 3"));
        assert_eq!(out.report.failures.len(), 1);
        assert!(matches!(
            out.report.failures[0],
            CaptionError::Exhausted { attempts: 3, .. }
        ));
        // 1 + 3 attempts + 1
        assert_eq!(fake.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let mut fake = FakeCaptioner::new();
        fake.rejected = vec![7];
        let fake = Arc::new(fake);
        let (_d, _c, e) = enricher(fake.clone()).await;
        let out = e
            .enrich(&doc(&[7]), far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert!(matches!(out.report.failures[0], CaptionError::Rejected { .. }));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identical_images_are_captioned_once() {
        let fake = Arc::new(FakeCaptioner::new());
        let (_d, cache, e) = enricher(fake.clone()).await;
        let out = e
            .enrich(&doc(&[4, 4, 4]), far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.markdown.matches("caption 4").count(), 3);
        assert_eq!(out.report.unique_images, 1);
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn cached_captions_skip_the_service() {
        let fake = Arc::new(FakeCaptioner::new());
        let (_d, _c, e) = enricher(fake.clone()).await;
        let d = doc(&[1, 2]);
        e.enrich(&d, far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        let again = e
            .enrich(&d, far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
        assert_eq!(again.report.cache_hits, 2);
    }

    #[tokio::test]
    async fn deadline_keeps_resolved_captions() {
        let mut fake = FakeCaptioner::new();
        fake.delays = HashMap::from([(2, 5_000)]);
        let (_d, _c, e) = enricher(Arc::new(fake)).await;
        let deadline = Instant::now() + Duration::from_millis(300);
        let out = e
            .enrich(&doc(&[1, 2]), deadline, &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert!(out.markdown.contains("caption 1"));
        assert!(out.markdown.contains(PLACEHOLDER_CAPTION));
        assert!(matches!(out.report.failures[0], CaptionError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let fake = Arc::new(FakeCaptioner::new());
        let (_d, cache, e) = enricher(fake.clone()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = e
            .enrich(&doc(&[1, 2]), far(), &cancel, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.report.failures.len(), 2);
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn no_images_only_normalises() {
        let fake = Arc::new(FakeCaptioner::new());
        let (_d, _c, e) = enricher(fake).await;
        let out = e
            .enrich(&doc(&[]), far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(out.markdown, "start\n");
        assert_eq!(out.report.total_images, 0);
    }

    #[tokio::test]
    async fn concurrent_documents_share_caption_calls() {
        let mut fake = FakeCaptioner::new();
        fake.delays = HashMap::from([(1, 40), (2, 40)]);
        let fake = Arc::new(fake);
        let (_d, cache, e) = enricher(fake.clone()).await;
        let other = CaptionEnricher::new(fake.clone(), cache, e.settings().clone());
        let cancel = CancellationToken::new();

        let (doc_a, doc_b) = (doc(&[1, 2]), doc(&[2, 1]));
        let (a, b) = tokio::join!(
            e.enrich(&doc_a, far(), &cancel, &NoopObserver),
            other.enrich(&doc_b, far(), &cancel, &NoopObserver),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.report.captioned + b.report.captioned, 2);
        assert_eq!(a.report.cache_hits + b.report.cache_hits, 2);
        assert!(!a.report.is_degraded() && !b.report.is_degraded());
    }

    /// Stores a different caption under the image's key mid-call, as another
    /// process sharing the cache would.
    struct RacingCaptioner {
        cache: Arc<ContentCache>,
        key: StageKey,
    }

    #[async_trait]
    impl CaptionService for RacingCaptioner {
        async fn caption(
            &self,
            _model: &str,
            _image: &[u8],
            _mime: &str,
            _prompt: &str,
        ) -> Result<String, ServiceError> {
            self.cache
                .put(&self.key, b"a pie chart", "text/plain")
                .await
                .unwrap();
            Ok("a bar chart".into())
        }
    }

    #[tokio::test]
    async fn caption_collision_fails_the_enrichment() {
        let (_d, cache, e) = enricher(Arc::new(FakeCaptioner::new())).await;
        let key = e.caption_key(&content_hash(&[7]));
        let racing = RacingCaptioner {
            cache: cache.clone(),
            key,
        };
        let e = CaptionEnricher::new(Arc::new(racing), cache, e.settings().clone());

        let err = e
            .enrich(&doc(&[7]), far(), &CancellationToken::new(), &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DocQaError::CacheCorruption {
                scope: CacheScope::Caption,
                ..
            }
        ));
    }

    /// Serves every request with one fixed model.
    struct FixedModelCaptioner;

    #[async_trait]
    impl CaptionService for FixedModelCaptioner {
        async fn caption(
            &self,
            _model: &str,
            _image: &[u8],
            _mime: &str,
            _prompt: &str,
        ) -> Result<String, ServiceError> {
            Ok("a chart".into())
        }

        fn caption_model(&self, _requested: &str) -> String {
            "local:llava".into()
        }
    }

    #[tokio::test]
    async fn caption_key_uses_the_serving_model() {
        let (_d, cache, e) = enricher(Arc::new(FakeCaptioner::new())).await;
        let mut settings = e.settings().clone();
        let fixed_a =
            CaptionEnricher::new(Arc::new(FixedModelCaptioner), cache.clone(), settings.clone());
        settings.model = "vision-other".into();
        let fixed_b = CaptionEnricher::new(Arc::new(FixedModelCaptioner), cache, settings);

        assert_eq!(fixed_a.caption_key("abc"), fixed_b.caption_key("abc"));
        assert_ne!(fixed_a.caption_key("abc"), e.caption_key("abc"));
    }

    #[test]
    fn caption_key_depends_on_model_and_prompt() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (_d, cache, e) = rt.block_on(enricher(Arc::new(FakeCaptioner::new())));
        let a = e.caption_key("abc");
        let mut settings = e.settings().clone();
        settings.prompt = "other".into();
        let e2 = CaptionEnricher::new(Arc::new(FakeCaptioner::new()), cache, settings);
        assert_ne!(a, e2.caption_key("abc"));
        assert_eq!(a, e.caption_key("abc"));
    }
}

//! Format normalization: any supported document → canonical PDF bytes.
//!
//! PDFs pass through unchanged after a header check. Office and image formats
//! go through the [`DocumentConverter`]. Unsupported types fail before the
//! converter is touched.

use super::document::{CanonicalPdf, Document};
use crate::error::DocQaError;
use crate::services::{ConversionError, DocumentConverter};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

pub struct Normalizer {
    converter: Arc<dyn DocumentConverter>,
    attempts: u32,
    backoff_ms: u64,
}

impl Normalizer {
    pub fn new(converter: Arc<dyn DocumentConverter>, attempts: u32, backoff_ms: u64) -> Self {
        Self {
            converter,
            attempts: attempts.max(1),
            backoff_ms,
        }
    }

    /// Produce canonical PDF bytes for `doc`.
    ///
    /// `ConversionFailed` is retried up to the configured attempt count;
    /// `ConversionUnavailable` is returned on the first occurrence since a
    /// missing converter does not appear between attempts.
    pub async fn normalize(&self, doc: &Document) -> Result<CanonicalPdf, DocQaError> {
        if !doc.media_type.is_supported() {
            return Err(DocQaError::UnsupportedFormat {
                media_type: doc.media_type.to_string(),
            });
        }

        if doc.media_type.is_pdf() {
            return CanonicalPdf::new(doc.bytes.clone()).ok_or_else(|| {
                DocQaError::ConversionFailed {
                    attempts: 0,
                    detail: format!("{} is declared as PDF but lacks a %PDF header", doc.source),
                }
            });
        }

        let mut last_err = String::new();
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                let backoff = self.backoff_ms * 2u64.pow(attempt - 2);
                warn!(
                    "Conversion of {}: retry {}/{} after {}ms",
                    doc.source,
                    attempt - 1,
                    self.attempts - 1,
                    backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self
                .converter
                .convert_to_pdf(&doc.bytes, &doc.media_type)
                .await
            {
                Ok(bytes) => match CanonicalPdf::new(bytes) {
                    Some(pdf) => {
                        info!(
                            "Converted {} ({}) to PDF: {} bytes",
                            doc.source,
                            doc.media_type,
                            pdf.as_bytes().len()
                        );
                        return Ok(pdf);
                    }
                    None => last_err = "converter output is not a PDF".into(),
                },
                Err(ConversionError::Unavailable { detail, hint }) => {
                    return Err(DocQaError::ConversionUnavailable { detail, hint });
                }
                Err(ConversionError::Failed { detail }) => {
                    warn!("Conversion attempt {} failed: {}", attempt, detail);
                    last_err = detail;
                }
            }
        }

        Err(DocQaError::ConversionFailed {
            attempts: self.attempts,
            detail: last_err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::document::MediaType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedConverter {
        calls: AtomicUsize,
        fail_first: usize,
        unavailable: bool,
    }

    #[async_trait]
    impl DocumentConverter for ScriptedConverter {
        async fn convert_to_pdf(
            &self,
            _bytes: &[u8],
            _media_type: &MediaType,
        ) -> Result<Vec<u8>, ConversionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable {
                return Err(ConversionError::Unavailable {
                    detail: "soffice not found".into(),
                    hint: "install it".into(),
                });
            }
            if n < self.fail_first {
                return Err(ConversionError::Failed {
                    detail: "exit 1".into(),
                });
            }
            Ok(b"%PDF-1.7 converted".to_vec())
        }
    }

    fn normalizer(fail_first: usize, unavailable: bool) -> (Arc<ScriptedConverter>, Normalizer) {
        let conv = Arc::new(ScriptedConverter {
            calls: AtomicUsize::new(0),
            fail_first,
            unavailable,
        });
        (conv.clone(), Normalizer::new(conv, 3, 1))
    }

    #[tokio::test]
    async fn pdf_is_identity() {
        let (conv, n) = normalizer(0, false);
        let doc = Document::new(b"%PDF-1.4 body".to_vec(), MediaType::Pdf, "a.pdf");
        let pdf = n.normalize(&doc).await.unwrap();
        assert_eq!(pdf.as_bytes(), b"%PDF-1.4 body");
        assert_eq!(conv.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fake_pdf_fails() {
        let (_, n) = normalizer(0, false);
        let doc = Document::new(b"GIF89a".to_vec(), MediaType::Pdf, "a.pdf");
        assert!(matches!(
            n.normalize(&doc).await,
            Err(DocQaError::ConversionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_never_reaches_converter() {
        let (conv, n) = normalizer(0, false);
        let doc = Document::new(b"a,b".to_vec(), MediaType::Unsupported("text/csv".into()), "x");
        let err = n.normalize(&doc).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
        assert_eq!(conv.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_failed_conversions() {
        let (conv, n) = normalizer(2, false);
        let doc = Document::new(b"PK".to_vec(), MediaType::Docx, "a.docx");
        assert!(n.normalize(&doc).await.is_ok());
        assert_eq!(conv.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let (conv, n) = normalizer(10, false);
        let doc = Document::new(b"PK".to_vec(), MediaType::Docx, "a.docx");
        let err = n.normalize(&doc).await.unwrap_err();
        assert!(matches!(err, DocQaError::ConversionFailed { attempts: 3, .. }));
        assert_eq!(conv.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unavailable_is_not_retried() {
        let (conv, n) = normalizer(0, true);
        let doc = Document::new(b"PK".to_vec(), MediaType::Pptx, "a.pptx");
        let err = n.normalize(&doc).await.unwrap_err();
        assert!(matches!(err, DocQaError::ConversionUnavailable { .. }));
        assert!(err.is_recoverable());
        assert_eq!(conv.calls.load(Ordering::SeqCst), 1);
    }
}

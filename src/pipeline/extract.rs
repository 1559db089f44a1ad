//! Structural extraction: canonical PDF → Markdown + ordered image manifest.
//!
//! ## Why walk page objects?
//!
//! Page text alone loses where figures sit. Walking each page's objects in
//! content-stream order yields text and images interleaved the way the
//! author placed them, so every figure can be replaced in place later.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a synchronous C++ library; calls run on the blocking pool so
//! the async workers stay free.

use super::document::CanonicalPdf;
use super::markdown::clean_markdown;
use crate::error::DocQaError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::ops::Range;
use tracing::{debug, info};

/// An embedded image and where its tag sits in the Markdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// Position among the document's images, starting at 0.
    pub index: usize,
    /// Byte range of the `![..](..)` tag in [`ExtractedDocument::markdown`].
    pub span: Range<usize>,
    pub alt: String,
    pub mime: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Output of the extract stage, cached as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub markdown: String,
    pub images: Vec<ImageReference>,
    pub page_count: usize,
}

impl ExtractedDocument {
    pub fn to_json(&self) -> Result<Vec<u8>, DocQaError> {
        serde_json::to_vec(self).map_err(|e| DocQaError::Internal(format!("extract payload: {e}")))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, DocQaError> {
        serde_json::from_slice(bytes)
            .map_err(|e| DocQaError::Internal(format!("cached extract payload: {e}")))
    }
}

/// Converts canonical PDF bytes into an [`ExtractedDocument`].
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, pdf: &CanonicalPdf) -> Result<ExtractedDocument, DocQaError>;
}

/// One unit of page content in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Text(String),
    /// PNG-encoded image bytes.
    Image(Vec<u8>),
}

/// Assemble per-page blocks into Markdown, recording each image tag's span.
///
/// Image `n` (1-based) is written as `![image n](image-nnn.png)`. Text
/// blocks are cleaned one by one before they are placed, so the spans
/// recorded while writing stay exact and text that happens to contain `![`
/// never merges with a tag.
pub fn assemble(pages: Vec<Vec<Block>>) -> ExtractedDocument {
    let page_count = pages.len();
    let mut markdown = String::new();
    let mut images = Vec::new();

    for (page_idx, blocks) in pages.into_iter().enumerate() {
        if page_count > 1 {
            markdown.push_str(&format!("<!-- page {} -->\n\n", page_idx + 1));
        }
        let mut in_text = false;
        for block in blocks {
            match block {
                Block::Text(text) => {
                    let text = clean_markdown(&text);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    markdown.push_str(text);
                    markdown.push('\n');
                    in_text = true;
                }
                Block::Image(png) => {
                    let index = images.len();
                    if in_text {
                        markdown.push('\n');
                    }
                    let alt = format!("image {}", index + 1);
                    let start = markdown.len();
                    markdown.push_str(&format!("![{alt}](image-{:03}.png)", index + 1));
                    let span = start..markdown.len();
                    markdown.push_str("\n\n");
                    images.push(ImageReference {
                        index,
                        span,
                        alt,
                        mime: "image/png".to_string(),
                        data: png,
                    });
                    in_text = false;
                }
            }
        }
        markdown.push('\n');
    }

    // Only trailing whitespace goes; every span lies before it.
    let end = markdown.trim_end().len();
    markdown.truncate(end);
    markdown.push('\n');

    ExtractedDocument {
        markdown,
        images,
        page_count,
    }
}

/// pdfium-backed extractor.
#[derive(Debug, Clone)]
pub struct PdfiumExtractor {
    min_image_side: u32,
    password: Option<String>,
}

impl PdfiumExtractor {
    pub fn new(min_image_side: u32, password: Option<String>) -> Self {
        Self {
            min_image_side,
            password,
        }
    }
}

#[async_trait]
impl Extractor for PdfiumExtractor {
    async fn extract(&self, pdf: &CanonicalPdf) -> Result<ExtractedDocument, DocQaError> {
        let bytes = pdf.as_bytes().to_vec();
        let min_side = self.min_image_side;
        let password = self.password.clone();

        let pages = tokio::task::spawn_blocking(move || {
            extract_blocks_blocking(bytes, password.as_deref(), min_side)
        })
        .await
        .map_err(|e| DocQaError::Internal(format!("Extract task panicked: {}", e)))??;

        let doc = assemble(pages);
        info!(
            "Extracted {} pages: {} bytes of Markdown, {} images",
            doc.page_count,
            doc.markdown.len(),
            doc.images.len()
        );
        Ok(doc)
    }
}

/// Blocking implementation of extraction.
fn extract_blocks_blocking(
    bytes: Vec<u8>,
    password: Option<&str>,
    min_side: u32,
) -> Result<Vec<Vec<Block>>, DocQaError> {
    let pdfium = pdfium_auto::bind_pdfium_silent().map_err(|e| DocQaError::ExtractionFailed {
        detail: format!("PDFium engine unavailable: {e}"),
    })?;

    let document = pdfium.load_pdf_from_byte_vec(bytes, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        let detail = if err_str.to_ascii_lowercase().contains("password") {
            "document is encrypted and no valid password was supplied".to_string()
        } else {
            format!("corrupt or unreadable PDF: {err_str}")
        };
        DocQaError::ExtractionFailed { detail }
    })?;

    let mut pages = Vec::new();
    for (page_idx, page) in document.pages().iter().enumerate() {
        let mut blocks = Vec::new();
        for object in page.objects().iter() {
            if let Some(text) = object.as_text_object() {
                blocks.push(Block::Text(text.text()));
            } else if let Some(image) = object.as_image_object() {
                let raw = match image.get_raw_image() {
                    Ok(img) => img,
                    Err(e) => {
                        debug!("Page {}: skipping unreadable image: {:?}", page_idx + 1, e);
                        continue;
                    }
                };
                if raw.width() < min_side || raw.height() < min_side {
                    debug!(
                        "Page {}: skipping {}x{} decoration",
                        page_idx + 1,
                        raw.width(),
                        raw.height()
                    );
                    continue;
                }
                match encode_png(&raw) {
                    Ok(png) => blocks.push(Block::Image(png)),
                    Err(e) => debug!("Page {}: image encoding failed: {}", page_idx + 1, e),
                }
            }
        }
        pages.push(blocks);
    }

    if pages.is_empty() {
        return Err(DocQaError::ExtractionFailed {
            detail: "document has no pages".into(),
        });
    }
    Ok(pages)
}

/// PNG-encode an embedded image. Lossless, so text inside figures stays crisp.
fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

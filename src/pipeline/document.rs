//! Input documents and media-type detection.
//!
//! A document reaches the pipeline either as a local path or as inline
//! base64 bytes. Its media type comes from, in order: the declared value,
//! the file extension, the leading magic bytes. Once a [`Document`] exists
//! its type is fixed; nothing downstream re-sniffs it.

use crate::cache::content_hash;
use crate::error::DocQaError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Media types known to the normalizer, plus a carrier for everything else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    Pdf,
    Doc,
    Docx,
    Ppt,
    Pptx,
    Xls,
    Xlsx,
    Hwp,
    Hwpx,
    Odt,
    Odp,
    Ods,
    Rtf,
    Png,
    Jpeg,
    /// Anything else; carries the declared MIME type or extension.
    Unsupported(String),
}

const TABLE: &[(MediaType, &str, &[&str])] = &[
    (MediaType::Pdf, "application/pdf", &["pdf"]),
    (MediaType::Doc, "application/msword", &["doc"]),
    (
        MediaType::Docx,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        &["docx"],
    ),
    (MediaType::Ppt, "application/vnd.ms-powerpoint", &["ppt"]),
    (
        MediaType::Pptx,
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        &["pptx"],
    ),
    (MediaType::Xls, "application/vnd.ms-excel", &["xls"]),
    (
        MediaType::Xlsx,
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        &["xlsx"],
    ),
    (MediaType::Hwp, "application/x-hwp", &["hwp"]),
    (MediaType::Hwpx, "application/hwp+zip", &["hwpx"]),
    (MediaType::Odt, "application/vnd.oasis.opendocument.text", &["odt"]),
    (
        MediaType::Odp,
        "application/vnd.oasis.opendocument.presentation",
        &["odp"],
    ),
    (
        MediaType::Ods,
        "application/vnd.oasis.opendocument.spreadsheet",
        &["ods"],
    ),
    (MediaType::Rtf, "application/rtf", &["rtf"]),
    (MediaType::Png, "image/png", &["png"]),
    (MediaType::Jpeg, "image/jpeg", &["jpg", "jpeg"]),
];

impl MediaType {
    /// Parse a declared type: either a MIME type or a bare extension.
    pub fn from_declared(declared: &str) -> Self {
        let d = declared.trim().to_ascii_lowercase();
        let d = d.split(';').next().unwrap_or("").trim();
        if d.contains('/') {
            Self::from_mime(d)
        } else {
            Self::from_extension(d.trim_start_matches('.'))
        }
    }

    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        TABLE
            .iter()
            .find(|(_, m, _)| *m == mime)
            .map(|(t, _, _)| t.clone())
            .unwrap_or_else(|| match mime.as_str() {
                "image/jpg" | "image/pjpeg" => MediaType::Jpeg,
                "text/rtf" => MediaType::Rtf,
                _ => MediaType::Unsupported(mime),
            })
    }

    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        TABLE
            .iter()
            .find(|(_, _, exts)| exts.contains(&ext.as_str()))
            .map(|(t, _, _)| t.clone())
            .unwrap_or(MediaType::Unsupported(ext))
    }

    /// Guess the type from leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            return Some(MediaType::Pdf);
        }
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(MediaType::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(MediaType::Jpeg);
        }
        if bytes.starts_with(b"{\\rtf") {
            return Some(MediaType::Rtf);
        }
        if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
            // OLE compound file; LibreOffice detects the concrete filter itself.
            return Some(MediaType::Doc);
        }
        if bytes.starts_with(b"PK\x03\x04") {
            let head = &bytes[..bytes.len().min(64 * 1024)];
            let has = |needle: &[u8]| head.windows(needle.len()).any(|w| w == needle);
            return Some(if has(b"word/") {
                MediaType::Docx
            } else if has(b"ppt/") {
                MediaType::Pptx
            } else if has(b"xl/") {
                MediaType::Xlsx
            } else if has(b"opendocument.text") {
                MediaType::Odt
            } else if has(b"opendocument.presentation") {
                MediaType::Odp
            } else if has(b"opendocument.spreadsheet") {
                MediaType::Ods
            } else if has(b"Contents/") || has(b"hwpml") {
                MediaType::Hwpx
            } else {
                MediaType::Unsupported("application/zip".into())
            });
        }
        has_pdf_header(bytes).then_some(MediaType::Pdf)
    }

    pub fn mime(&self) -> &str {
        match self {
            MediaType::Unsupported(s) => s,
            known => TABLE
                .iter()
                .find(|(t, _, _)| t == known)
                .map(|(_, m, _)| *m)
                .unwrap_or("application/octet-stream"),
        }
    }

    /// Canonical file extension, used to name converter input files.
    pub fn extension(&self) -> &str {
        match self {
            MediaType::Unsupported(_) => "bin",
            known => TABLE
                .iter()
                .find(|(t, _, _)| t == known)
                .map(|(_, _, exts)| exts[0])
                .unwrap_or("bin"),
        }
    }

    pub fn is_pdf(&self) -> bool {
        matches!(self, MediaType::Pdf)
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, MediaType::Unsupported(_))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// Raw input bytes with their media type.
#[derive(Debug, Clone)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub media_type: MediaType,
    /// Path or `<inline>`, for logs and messages only.
    pub source: String,
}

impl Document {
    pub fn new(bytes: Vec<u8>, media_type: MediaType, source: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type,
            source: source.into(),
        }
    }

    /// Read a local file, validating existence and read permission.
    pub async fn load(path: impl AsRef<Path>, declared: Option<&str>) -> Result<Self, DocQaError> {
        let path = path.as_ref();
        let path: PathBuf = expand_home(path);

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(DocQaError::PermissionDenied { path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DocQaError::DocumentNotFound { path });
            }
            Err(e) => {
                return Err(DocQaError::Validation(format!(
                    "cannot read '{}': {e}",
                    path.display()
                )));
            }
        };

        let media_type = match declared {
            Some(d) => MediaType::from_declared(d),
            None => detect(&path, &bytes),
        };
        debug!(
            "Loaded {} ({} bytes, {})",
            path.display(),
            bytes.len(),
            media_type
        );
        Ok(Self::new(bytes, media_type, path.display().to_string()))
    }

    /// Decode inline base64 content.
    pub fn from_base64(data: &str, declared: Option<&str>) -> Result<Self, DocQaError> {
        let cleaned: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = STANDARD
            .decode(cleaned.as_bytes())
            .map_err(|e| {
                DocQaError::Validation(format!("document_base64 is not valid base64: {e}"))
            })?;
        if bytes.is_empty() {
            return Err(DocQaError::Validation("document_base64 is empty".into()));
        }
        let media_type = match declared {
            Some(d) => MediaType::from_declared(d),
            None => MediaType::sniff(&bytes)
                .unwrap_or_else(|| MediaType::Unsupported("application/octet-stream".into())),
        };
        Ok(Self::new(bytes, media_type, "<inline>"))
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.bytes)
    }
}

fn detect(path: &Path, bytes: &[u8]) -> MediaType {
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(MediaType::from_extension);
    match by_ext {
        Some(t) if t.is_supported() => t,
        other => MediaType::sniff(bytes).unwrap_or_else(|| {
            other.unwrap_or_else(|| MediaType::Unsupported("application/octet-stream".into()))
        }),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Readers accept the `%PDF-` header anywhere in the first kilobyte.
const PDF_HEADER_WINDOW: usize = 1024;

/// True when a `%PDF-` header starts within the first 1024 bytes.
pub fn has_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    window.windows(5).any(|w| w == b"%PDF-")
}

/// PDF bytes produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPdf(Vec<u8>);

impl CanonicalPdf {
    /// Wrap bytes that carry a PDF header.
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        has_pdf_header(&bytes).then_some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.0)
    }
}

//! LibreOffice headless converter.
//!
//! Each conversion runs in its own temporary directory with a private user
//! profile, so concurrent conversions do not fight over the profile lock that
//! a shared LibreOffice installation otherwise holds.

use super::{ConversionError, DocumentConverter};
use crate::pipeline::document::{has_pdf_header, MediaType};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

const INSTALL_HINT: &str = "Install LibreOffice (e.g. `apt install libreoffice-core` or \
`brew install --cask libreoffice`) and make sure `soffice` is on PATH, or pass --converter.";

#[derive(Debug, Clone)]
pub struct SofficeConverter {
    program: String,
    timeout: Duration,
}

impl SofficeConverter {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DocumentConverter for SofficeConverter {
    async fn convert_to_pdf(
        &self,
        bytes: &[u8],
        media_type: &MediaType,
    ) -> Result<Vec<u8>, ConversionError> {
        let work = TempDir::new().map_err(|e| ConversionError::Failed {
            detail: format!("temp dir: {e}"),
        })?;
        let input = work.path().join(format!("input.{}", media_type.extension()));
        tokio::fs::write(&input, bytes)
            .await
            .map_err(|e| ConversionError::Failed {
                detail: format!("writing input: {e}"),
            })?;

        let out_dir = work.path().join("out");
        let profile = work.path().join("profile");
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("-env:UserInstallation={}", file_url(&profile)))
            .args(["--headless", "--norestore", "--convert-to", "pdf", "--outdir"])
            .arg(&out_dir)
            .arg(&input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} on {} bytes of {}", self.program, bytes.len(), media_type);
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConversionError::Unavailable {
                    detail: format!("'{}' was not found", self.program),
                    hint: INSTALL_HINT.to_string(),
                }
            } else {
                ConversionError::Unavailable {
                    detail: format!("could not start '{}': {e}", self.program),
                    hint: INSTALL_HINT.to_string(),
                }
            }
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ConversionError::Failed {
                detail: format!("converter did not finish within {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| ConversionError::Failed {
                detail: format!("waiting for converter: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConversionError::Failed {
                detail: format!("converter exited with {}: {}", output.status, stderr.trim()),
            });
        }

        let pdf_path = out_dir.join("input.pdf");
        let pdf = tokio::fs::read(&pdf_path)
            .await
            .map_err(|e| ConversionError::Failed {
                detail: format!("converter produced no PDF ({e})"),
            })?;
        if !has_pdf_header(&pdf) {
            return Err(ConversionError::Failed {
                detail: "converter output is not a PDF".into(),
            });
        }
        Ok(pdf)
    }
}

fn file_url(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    if s.starts_with('/') {
        format!("file://{s}")
    } else {
        format!("file:///{s}")
    }
}

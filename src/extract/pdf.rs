//! PDF text layer via `pdftotext` (poppler-utils).
//!
//! Anything that goes wrong here degrades to empty text plus a warning; a
//! broken PDF never fails the request.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExtractContext, ExtractedContent, ExtractionError, Extractor, SourceFile};

#[derive(Debug, Default)]
pub struct PdfExtractor;

fn has_pdf_magic(data: &[u8]) -> bool {
    data.len() >= 4 && &data[..4] == b"%PDF"
}

async fn write_temp(data: Bytes) -> Result<NamedTempFile, String> {
    tokio::task::spawn_blocking(move || {
        let mut tmpfile = NamedTempFile::new().map_err(|err| format!("temp file: {err}"))?;
        tmpfile
            .write_all(&data)
            .map_err(|err| format!("temp file write: {err}"))?;
        Ok(tmpfile)
    })
    .await
    .map_err(|err| format!("temp file task: {err}"))?
}

async fn run_pdftotext(bin: &str, data: Bytes, timeout: Duration) -> Result<String, String> {
    let tmpfile = write_temp(data).await?;

    let mut cmd = Command::new(bin);
    cmd.arg("-enc").arg("UTF-8").arg(tmpfile.path()).arg("-");
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| format!("{bin} timed out after {}s", timeout.as_secs()))?
        .map_err(|err| format!("failed to execute {bin}: {err}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{bin} failed ({}): {}", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl Extractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    async fn extract(
        &self,
        source: &SourceFile,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError> {
        if !has_pdf_magic(&source.data) {
            warn!(source = %source.name, "not a PDF (missing %PDF header); continuing without text");
            return Ok(ExtractedContent::empty());
        }

        match run_pdftotext(&cx.config.pdftotext_bin, source.data.clone(), cx.config.pdf_timeout()).await {
            Ok(text) => {
                debug!(source = %source.name, chars = text.len(), "pdf text extracted");
                // pdftotext separates pages with form feeds.
                Ok(ExtractedContent::text(text.replace('\u{c}', "\n").trim_end()))
            }
            Err(reason) => {
                warn!(source = %source.name, error = %reason, "pdf text extraction failed; continuing without text");
                Ok(ExtractedContent::empty())
            }
        }
    }
}

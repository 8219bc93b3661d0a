//! Per-format content extraction.
//!
//! Every attachment and context-file URL becomes one independent future. The
//! futures are joined without fail-fast, and [`fold`] merges the outcomes in a
//! fixed order: context files (URL order) first, then attachments (upload
//! order). Failures turn into inline system notes and never abort the request.

pub mod context;
pub mod docx;
pub mod image;
pub mod media;
mod ooxml;
pub mod pdf;
pub mod pptx;
pub mod spreadsheet;
pub mod text;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::budget;
use crate::intake::Attachment;
use crate::storage::{ObjectStore, StorageError};

pub use context::ContextFetcher;
pub use docx::WordExtractor;
pub use image::ImageExtractor;
pub use pdf::PdfExtractor;
pub use pptx::PresentationExtractor;
pub use spreadsheet::SpreadsheetExtractor;
pub use text::TextExtractor;

pub const DEFAULT_MAX_TEXT_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_SHEET_ROWS: usize = 1000;
const DEFAULT_PDF_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_FETCH_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to process {kind} {name}: {detail}")]
    ProcessingFailed {
        kind: &'static str,
        name: String,
        detail: String,
    },
    #[error("could not load context file {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("no extractor for media type {media_type}")]
    Unsupported { media_type: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Text-like sources above this size are replaced by a note.
    pub max_text_bytes: usize,
    pub max_sheet_rows: usize,
    pub pdftotext_bin: String,
    pub pdf_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub max_fetch_bytes: usize,
    /// URL prefixes context files may be fetched from. Empty rejects every
    /// context URL.
    pub allowed_origins: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
            max_sheet_rows: DEFAULT_MAX_SHEET_ROWS,
            pdftotext_bin: "pdftotext".to_string(),
            pdf_timeout_secs: DEFAULT_PDF_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_fetch_bytes: DEFAULT_MAX_FETCH_BYTES,
            allowed_origins: Vec::new(),
        }
    }
}

impl ExtractionConfig {
    pub fn pdf_timeout(&self) -> Duration {
        Duration::from_secs(self.pdf_timeout_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn with_allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceOrigin {
    Upload,
    /// A previously stored context file, reachable at `url`.
    Stored { url: String },
}

#[derive(Clone, Debug)]
pub struct SourceFile {
    pub name: String,
    pub media_type: String,
    pub data: Bytes,
    pub origin: SourceOrigin,
}

impl From<&Attachment> for SourceFile {
    fn from(attachment: &Attachment) -> Self {
        Self {
            name: attachment.name.clone(),
            media_type: attachment.media_type.clone(),
            data: attachment.data.clone(),
            origin: SourceOrigin::Upload,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractedContent {
    pub text: String,
    pub images: Vec<String>,
}

impl ExtractedContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Shared collaborators handed to every extractor.
#[derive(Clone)]
pub struct ExtractContext {
    pub store: Arc<dyn ObjectStore>,
    pub config: ExtractionConfig,
    pub http: reqwest::Client,
}

impl ExtractContext {
    pub fn new(store: Arc<dyn ObjectStore>, config: ExtractionConfig) -> Self {
        Self {
            store,
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(
        &self,
        source: &SourceFile,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaTypePattern {
    Exact(String),
    Prefix(String),
    Contains(String),
}

impl MediaTypePattern {
    pub fn exact(value: impl Into<String>) -> Self {
        Self::Exact(value.into())
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Self::Prefix(value.into())
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self::Contains(value.into())
    }

    pub fn matches(&self, media_type: &str) -> bool {
        match self {
            Self::Exact(value) => media_type == value,
            Self::Prefix(value) => media_type.starts_with(value.as_str()),
            Self::Contains(value) => media_type.contains(value.as_str()),
        }
    }
}

/// Ordered pattern table; the first matching pattern wins.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    entries: Vec<(MediaTypePattern, Arc<dyn Extractor>)>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let text: Arc<dyn Extractor> = Arc::new(TextExtractor);
        let sheets: Arc<dyn Extractor> = Arc::new(SpreadsheetExtractor);
        Self::new()
            .register(MediaTypePattern::prefix("image/"), Arc::new(ImageExtractor))
            .register(MediaTypePattern::exact(media::PDF), Arc::new(PdfExtractor))
            .register(MediaTypePattern::exact(media::DOCX), Arc::new(WordExtractor))
            .register(
                MediaTypePattern::exact(media::PPTX),
                Arc::new(PresentationExtractor),
            )
            .register(MediaTypePattern::exact(media::XLSX), Arc::clone(&sheets))
            .register(MediaTypePattern::exact(media::XLS), sheets)
            .register(MediaTypePattern::prefix("text/"), Arc::clone(&text))
            .register(MediaTypePattern::contains("json"), Arc::clone(&text))
            .register(MediaTypePattern::contains("javascript"), Arc::clone(&text))
            .register(MediaTypePattern::contains("xml"), Arc::clone(&text))
            .register(MediaTypePattern::exact(media::OCTET_STREAM), text)
    }

    pub fn register(mut self, pattern: MediaTypePattern, extractor: Arc<dyn Extractor>) -> Self {
        self.entries.push((pattern, extractor));
        self
    }

    pub fn lookup(&self, media_type: &str) -> Option<&Arc<dyn Extractor>> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(media_type))
            .map(|(_, extractor)| extractor)
    }

    pub async fn extract(
        &self,
        source: &SourceFile,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError> {
        let extractor =
            self.lookup(&source.media_type)
                .ok_or_else(|| ExtractionError::Unsupported {
                    media_type: source.media_type.clone(),
                })?;
        debug!(
            source = %source.name,
            media_type = %source.media_type,
            extractor = extractor.name(),
            bytes = source.data.len(),
            "extracting"
        );
        extractor.extract(source, cx).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    ContextFile,
    Attachment,
}

#[derive(Debug)]
pub struct SourceOutcome {
    pub name: String,
    pub kind: SourceKind,
    pub result: Result<ExtractedContent, ExtractionError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssembledContent {
    /// Wrapped per-source blocks and system notes, in merge order.
    pub text: String,
    pub images: Vec<String>,
    pub has_image: bool,
    pub notes: Vec<String>,
}

/// Extracts every context URL and attachment concurrently. Outcomes come back
/// in merge order whatever order the futures finish in.
pub async fn extract_all(
    registry: &ExtractorRegistry,
    cx: &ExtractContext,
    context_urls: &[String],
    attachments: &[Attachment],
) -> Vec<SourceOutcome> {
    let fetcher = &ContextFetcher::new(registry);
    let context_jobs = context_urls.iter().map(|url| async move {
        SourceOutcome {
            name: context::display_name(url),
            kind: SourceKind::ContextFile,
            result: fetcher.extract_url(url, cx).await,
        }
    });
    let attachment_jobs = attachments.iter().map(|attachment| async move {
        let source = SourceFile::from(attachment);
        SourceOutcome {
            name: attachment.name.clone(),
            kind: SourceKind::Attachment,
            result: registry.extract(&source, cx).await,
        }
    });

    let (mut outcomes, uploads) = futures_util::join!(
        join_all(context_jobs),
        join_all(attachment_jobs)
    );
    outcomes.extend(uploads);
    outcomes
}

/// Merges outcomes into one documents block. Each text is truncated to
/// `file_token_limit` before it is wrapped.
pub fn fold(outcomes: Vec<SourceOutcome>, file_token_limit: usize) -> AssembledContent {
    let mut blocks = Vec::new();
    let mut assembled = AssembledContent::default();

    for outcome in outcomes {
        match outcome.result {
            Ok(content) => {
                assembled.images.extend(content.images);
                if content.text.trim().is_empty() {
                    continue;
                }
                let truncation = budget::truncate(&content.text, file_token_limit);
                if truncation.truncated {
                    debug!(source = %outcome.name, "source text truncated to file budget");
                }
                let opener = match outcome.kind {
                    SourceKind::Attachment => "Content of",
                    SourceKind::ContextFile => "Content from",
                };
                blocks.push(format!(
                    "--- {opener} {name} ---\n{body}\n--- End of {name} ---",
                    name = outcome.name,
                    body = truncation.content,
                ));
            }
            Err(err) => {
                warn!(source = %outcome.name, error = %err, "extraction failed");
                let note = match &err {
                    ExtractionError::Fetch { .. } => format!("[System note: {err}]"),
                    _ => format!(
                        "[System note: {} could not be processed: {err}]",
                        outcome.name
                    ),
                };
                assembled.notes.push(note.clone());
                blocks.push(note);
            }
        }
    }

    assembled.has_image = !assembled.images.is_empty();
    assembled.text = blocks.join("\n\n");
    assembled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    struct Fixed(&'static str);

    #[async_trait]
    impl Extractor for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn extract(
            &self,
            _source: &SourceFile,
            _cx: &ExtractContext,
        ) -> Result<ExtractedContent, ExtractionError> {
            Ok(ExtractedContent::text(self.0))
        }
    }

    fn cx() -> ExtractContext {
        ExtractContext::new(Arc::new(MemoryObjectStore::new()), ExtractionConfig::default())
    }

    fn ok(name: &str, kind: SourceKind, text: &str) -> SourceOutcome {
        SourceOutcome {
            name: name.to_string(),
            kind,
            result: Ok(ExtractedContent::text(text)),
        }
    }

    #[test]
    fn patterns_match_by_kind() {
        assert!(MediaTypePattern::exact("text/csv").matches("text/csv"));
        assert!(!MediaTypePattern::exact("text/csv").matches("text/csvx"));
        assert!(MediaTypePattern::prefix("image/").matches("image/png"));
        assert!(MediaTypePattern::contains("json").matches("application/ld+json"));
    }

    #[test]
    fn default_registry_dispatches_by_media_type() {
        let registry = ExtractorRegistry::with_defaults();
        let name = |media_type: &str| registry.lookup(media_type).map(|e| e.name());
        assert_eq!(name("image/png"), Some("image"));
        assert_eq!(name(media::PDF), Some("pdf"));
        assert_eq!(name(media::DOCX), Some("docx"));
        assert_eq!(name(media::PPTX), Some("pptx"));
        assert_eq!(name(media::XLSX), Some("spreadsheet"));
        assert_eq!(name(media::XLS), Some("spreadsheet"));
        assert_eq!(name(media::CSV), Some("text"));
        assert_eq!(name("application/javascript"), Some("text"));
        assert_eq!(name("application/rss+xml"), Some("text"));
        assert_eq!(name(media::OCTET_STREAM), Some("text"));
        assert_eq!(name("application/zip"), None);
    }

    #[test]
    fn first_registered_pattern_wins() {
        let registry = ExtractorRegistry::new()
            .register(MediaTypePattern::prefix("text/"), Arc::new(Fixed("first")))
            .register(MediaTypePattern::exact("text/csv"), Arc::new(Fixed("second")));
        assert_eq!(registry.lookup("text/csv").unwrap().name(), "first");
    }

    #[tokio::test]
    async fn unknown_media_type_is_unsupported() {
        let registry = ExtractorRegistry::new();
        let source = SourceFile {
            name: "a.bin".to_string(),
            media_type: "application/zip".to_string(),
            data: Bytes::new(),
            origin: SourceOrigin::Upload,
        };
        let err = registry.extract(&source, &cx()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Unsupported { .. }));
    }

    #[test]
    fn fold_wraps_sources_and_keeps_order() {
        let assembled = fold(
            vec![
                ok("guide.md", SourceKind::ContextFile, "from context"),
                ok("a.txt", SourceKind::Attachment, "alpha"),
                ok("empty.txt", SourceKind::Attachment, "  "),
            ],
            15_000,
        );
        assert_eq!(
            assembled.text,
            "--- Content from guide.md ---\nfrom context\n--- End of guide.md ---\n\n\
             --- Content of a.txt ---\nalpha\n--- End of a.txt ---"
        );
        assert!(!assembled.has_image);
        assert!(assembled.notes.is_empty());
    }

    #[test]
    fn fold_turns_failures_into_notes() {
        let assembled = fold(
            vec![
                SourceOutcome {
                    name: "gone.pdf".to_string(),
                    kind: SourceKind::ContextFile,
                    result: Err(ExtractionError::Fetch {
                        url: "https://blob.example/gone.pdf".to_string(),
                        reason: "HTTP 404 Not Found".to_string(),
                    }),
                },
                SourceOutcome {
                    name: "deck.pptx".to_string(),
                    kind: SourceKind::Attachment,
                    result: Err(ExtractionError::ProcessingFailed {
                        kind: "presentation",
                        name: "deck.pptx".to_string(),
                        detail: "invalid Zip archive".to_string(),
                    }),
                },
                ok("b.txt", SourceKind::Attachment, "beta"),
            ],
            15_000,
        );
        assert_eq!(assembled.notes.len(), 2);
        assert_eq!(
            assembled.notes[0],
            "[System note: could not load context file https://blob.example/gone.pdf: HTTP 404 Not Found]"
        );
        assert!(assembled.notes[1].starts_with(
            "[System note: deck.pptx could not be processed: failed to process presentation deck.pptx"
        ));
        assert!(assembled.text.ends_with("--- Content of b.txt ---\nbeta\n--- End of b.txt ---"));
    }

    #[test]
    fn fold_applies_file_budget_and_collects_images() {
        let assembled = fold(
            vec![
                ok("big.txt", SourceKind::Attachment, &"x".repeat(1_000)),
                SourceOutcome {
                    name: "pic.png".to_string(),
                    kind: SourceKind::Attachment,
                    result: Ok(ExtractedContent {
                        text: String::new(),
                        images: vec!["memory://1/pic.png".to_string()],
                    }),
                },
            ],
            100,
        );
        assert!(assembled.text.contains("[Content truncated: original was ~250 tokens"));
        assert!(assembled.has_image);
        assert_eq!(assembled.images, vec!["memory://1/pic.png"]);
    }

    #[tokio::test]
    async fn extract_all_isolates_failures() {
        let registry = ExtractorRegistry::with_defaults();
        let attachments = vec![
            Attachment::new("notes.txt", media::PLAIN, Bytes::from_static(b"hello")),
            Attachment::new("broken.pptx", media::PPTX, Bytes::from_static(b"not a zip")),
            Attachment::new("more.md", media::MARKDOWN, Bytes::from_static(b"# title")),
        ];
        let outcomes = extract_all(&registry, &cx(), &[], &attachments).await;
        let names: Vec<_> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["notes.txt", "broken.pptx", "more.md"]);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(ExtractionError::ProcessingFailed { .. })
        ));
        assert_eq!(outcomes[2].result.as_ref().unwrap().text, "# title");
    }
}

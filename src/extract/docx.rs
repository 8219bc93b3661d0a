use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use super::ooxml::{self, MediaEntry};
use super::{ExtractContext, ExtractedContent, ExtractionError, Extractor, SourceFile};

const DOCUMENT_PART: &str = "word/document.xml";
const MEDIA_PREFIX: &str = "word/media/";

fn runs_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|</w:p>").expect("docx run regex is valid")
    })
}

/// Word documents. Text and embedded images are read independently; a
/// failure in one never suppresses the other.
#[derive(Debug, Default)]
pub struct WordExtractor;

fn read_package(name: &str, data: bytes::Bytes) -> (String, Vec<MediaEntry>) {
    let mut archive = match ooxml::open(&data) {
        Ok(archive) => archive,
        Err(err) => {
            warn!(source = %name, error = %err, "word document is not a readable package");
            return (String::new(), Vec::new());
        }
    };

    let text = match ooxml::read_entry(&mut archive, DOCUMENT_PART) {
        Ok(xml) => ooxml::collect_runs(&xml, runs_regex()),
        Err(err) => {
            warn!(source = %name, error = %err, "word document text unavailable");
            String::new()
        }
    };
    let media = ooxml::media_entries(&mut archive, MEDIA_PREFIX);
    (text, media)
}

#[async_trait]
impl Extractor for WordExtractor {
    fn name(&self) -> &'static str {
        "docx"
    }

    async fn extract(
        &self,
        source: &SourceFile,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError> {
        let name = source.name.clone();
        let data = source.data.clone();
        let (text, media) = tokio::task::spawn_blocking(move || read_package(&name, data))
            .await
            .map_err(|err| ExtractionError::ProcessingFailed {
                kind: "document",
                name: source.name.clone(),
                detail: err.to_string(),
            })?;

        let images = ooxml::upload_media(&source.name, media, cx).await;
        Ok(ExtractedContent { text, images })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractionConfig;
    use crate::extract::SourceOrigin;
    use crate::extract::media;
    use crate::extract::ooxml::tests::build_zip;
    use crate::storage::MemoryObjectStore;
    use bytes::Bytes;
    use std::sync::Arc;

    fn source(data: Bytes) -> SourceFile {
        SourceFile {
            name: "report.docx".to_string(),
            media_type: media::DOCX.to_string(),
            data,
            origin: SourceOrigin::Upload,
        }
    }

    #[tokio::test]
    async fn extracts_paragraphs_and_uploads_media() {
        let document = br#"<?xml version="1.0"?><w:document><w:body>
<w:p><w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space="preserve"> report</w:t></w:r></w:p>
<w:p><w:r><w:t>Revenue &gt; plan</w:t></w:r></w:p>
</w:body></w:document>"#;
        let data = build_zip(&[
            ("word/document.xml", document.as_slice()),
            ("word/media/image1.png", b"png".as_slice()),
        ]);
        let store = Arc::new(MemoryObjectStore::new());
        let cx = ExtractContext::new(store.clone(), ExtractionConfig::default());

        let content = WordExtractor.extract(&source(data), &cx).await.unwrap();
        assert_eq!(content.text, "Quarterly report\nRevenue > plan");
        assert_eq!(content.images.len(), 1);
        let (media_type, bytes) = store.get(&content.images[0]).await.unwrap();
        assert_eq!(media_type, "image/png");
        assert_eq!(bytes.as_ref(), b"png");
    }

    #[tokio::test]
    async fn missing_body_still_yields_images() {
        let data = build_zip(&[("word/media/image1.gif", b"gif".as_slice())]);
        let cx = ExtractContext::new(Arc::new(MemoryObjectStore::new()), ExtractionConfig::default());
        let content = WordExtractor.extract(&source(data), &cx).await.unwrap();
        assert!(content.text.is_empty());
        assert_eq!(content.images.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_package_degrades_to_empty() {
        let cx = ExtractContext::new(Arc::new(MemoryObjectStore::new()), ExtractionConfig::default());
        let content = WordExtractor
            .extract(&source(Bytes::from_static(b"garbage")), &cx)
            .await
            .unwrap();
        assert_eq!(content, ExtractedContent::empty());
    }
}

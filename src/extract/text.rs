use async_trait::async_trait;

use super::{ExtractContext, ExtractedContent, ExtractionError, Extractor, SourceFile};

/// Plain text, markdown, CSV, JSON and other text-like payloads, decoded as
/// lossy UTF-8.
#[derive(Debug, Default)]
pub struct TextExtractor;

#[async_trait]
impl Extractor for TextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    async fn extract(
        &self,
        source: &SourceFile,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError> {
        let limit = cx.config.max_text_bytes;
        if source.data.len() > limit {
            return Ok(ExtractedContent::text(format!(
                "[System note: {} is too large to include as text ({} bytes, limit {limit} bytes)]",
                source.name,
                source.data.len()
            )));
        }
        Ok(ExtractedContent::text(
            String::from_utf8_lossy(&source.data).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractionConfig, SourceOrigin, media};
    use crate::storage::MemoryObjectStore;
    use bytes::Bytes;
    use std::sync::Arc;

    fn source(data: &'static [u8]) -> SourceFile {
        SourceFile {
            name: "notes.txt".to_string(),
            media_type: media::PLAIN.to_string(),
            data: Bytes::from_static(data),
            origin: SourceOrigin::Upload,
        }
    }

    fn cx(max_text_bytes: usize) -> ExtractContext {
        ExtractContext::new(
            Arc::new(MemoryObjectStore::new()),
            ExtractionConfig {
                max_text_bytes,
                ..ExtractionConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn decodes_verbatim() {
        let content = TextExtractor
            .extract(&source("naïve, café\n".as_bytes()), &cx(1024))
            .await
            .unwrap();
        assert_eq!(content.text, "naïve, café\n");
        assert!(content.images.is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let content = TextExtractor
            .extract(&source(b"ok \xff end"), &cx(1024))
            .await
            .unwrap();
        assert_eq!(content.text, "ok \u{fffd} end");
    }

    #[tokio::test]
    async fn oversized_text_becomes_a_note() {
        let content = TextExtractor
            .extract(&source(b"0123456789"), &cx(4))
            .await
            .unwrap();
        assert_eq!(
            content.text,
            "[System note: notes.txt is too large to include as text (10 bytes, limit 4 bytes)]"
        );
    }
}

use async_trait::async_trait;

use super::{ExtractContext, ExtractedContent, ExtractionError, Extractor, SourceFile, SourceOrigin};

/// Images carry no text. Uploads are persisted to the object store; stored
/// context files are referenced by their existing URL.
#[derive(Debug, Default)]
pub struct ImageExtractor;

#[async_trait]
impl Extractor for ImageExtractor {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn extract(
        &self,
        source: &SourceFile,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError> {
        let url = match &source.origin {
            SourceOrigin::Stored { url } => url.clone(),
            SourceOrigin::Upload => {
                cx.store
                    .put(&source.name, source.data.clone(), &source.media_type)
                    .await?
            }
        };
        Ok(ExtractedContent {
            text: String::new(),
            images: vec![url],
        })
    }
}

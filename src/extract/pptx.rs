use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use tracing::warn;

use super::ooxml::{self, MediaEntry};
use super::{ExtractContext, ExtractedContent, ExtractionError, Extractor, SourceFile};

const MEDIA_PREFIX: &str = "ppt/media/";

fn runs_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<a:t(?:\s[^>]*)?>(.*?)</a:t>|</a:p>").expect("pptx run regex is valid")
    })
}

fn slide_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").expect("pptx slide regex is valid"))
}

/// Slide parts ordered by slide number, not by archive order.
fn slide_parts(names: &[String]) -> Vec<(u32, String)> {
    let mut slides: Vec<(u32, String)> = names
        .iter()
        .filter_map(|name| {
            let number = slide_regex().captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((number, name.clone()))
        })
        .collect();
    slides.sort_by_key(|(number, _)| *number);
    slides
}

#[derive(Debug, Default)]
pub struct PresentationExtractor;

fn read_package(name: &str, data: Bytes) -> Result<(String, Vec<MediaEntry>), ExtractionError> {
    let mut archive = ooxml::open(&data).map_err(|err| ExtractionError::ProcessingFailed {
        kind: "presentation",
        name: name.to_string(),
        detail: err.to_string(),
    })?;

    let mut sections = Vec::new();
    for (number, part) in slide_parts(&ooxml::entry_names(&archive)) {
        match ooxml::read_entry(&mut archive, &part) {
            Ok(xml) => {
                let text = ooxml::collect_runs(&xml, runs_regex());
                if !text.trim().is_empty() {
                    sections.push(format!("Slide {number}:\n{text}"));
                }
            }
            Err(err) => warn!(source = %name, slide = number, error = %err, "skipping unreadable slide"),
        }
    }

    let media = ooxml::media_entries(&mut archive, MEDIA_PREFIX);
    Ok((sections.join("\n\n"), media))
}

#[async_trait]
impl Extractor for PresentationExtractor {
    fn name(&self) -> &'static str {
        "pptx"
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
                kind: "presentation",
                name: source.name.clone(),
                detail: err.to_string(),
            })??;

        let images = ooxml::upload_media(&source.name, media, cx).await;
        Ok(ExtractedContent { text, images })
    }
}

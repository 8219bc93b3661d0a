//! Previously stored context files, fetched by URL.

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tracing::warn;

use super::{
    ExtractContext, ExtractedContent, ExtractionError, ExtractorRegistry, SourceFile, SourceOrigin,
    media,
};

/// Last non-empty path segment of `url`, or the URL itself when it has none.
pub fn display_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .map(|segment| {
            url::form_urlencoded::parse(format!("n={segment}").as_bytes())
                .next()
                .map(|(_, decoded)| decoded.into_owned())
                .unwrap_or(segment)
        })
        .unwrap_or_else(|| url.to_string())
}

pub struct ContextFetcher<'a> {
    registry: &'a ExtractorRegistry,
}

impl<'a> ContextFetcher<'a> {
    pub fn new(registry: &'a ExtractorRegistry) -> Self {
        Self { registry }
    }

    /// Fetches the file and runs whichever extractor its response
    /// `Content-Type` selects.
    pub async fn extract_url(
        &self,
        url: &str,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError> {
        let source = fetch(url, cx).await?;
        self.registry.extract(&source, cx).await
    }
}

fn fetch_error(url: &str, reason: impl Into<String>) -> ExtractionError {
    ExtractionError::Fetch {
        url: url.to_string(),
        reason: reason.into(),
    }
}

/// `true` when `url` is http(s) and lies under one of `allowed`: same scheme,
/// host and port, and a path starting at a segment boundary of the prefix.
pub fn is_allowed_origin(url: &str, allowed: &[String]) -> bool {
    let Ok(target) = url::Url::parse(url) else {
        return false;
    };
    if !matches!(target.scheme(), "http" | "https") {
        return false;
    }
    allowed.iter().any(|prefix| {
        let Ok(prefix) = url::Url::parse(prefix) else {
            return false;
        };
        if prefix.origin() != target.origin() {
            return false;
        }
        let base = prefix.path().trim_end_matches('/');
        let path = target.path();
        base.is_empty()
            || path == base
            || path
                .strip_prefix(base)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

pub async fn fetch(url: &str, cx: &ExtractContext) -> Result<SourceFile, ExtractionError> {
    if !is_allowed_origin(url, &cx.config.allowed_origins) {
        warn!(url = %url, "context file url outside allowed origins");
        return Err(fetch_error(url, "not an allowed storage location"));
    }

    let response = cx
        .http
        .get(url)
        .timeout(cx.config.fetch_timeout())
        .send()
        .await
        .map_err(|err| fetch_error(url, err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fetch_error(url, format!("HTTP {status}")));
    }

    let media_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(media::normalize)
        .unwrap_or_else(|| media::OCTET_STREAM.to_string());

    let limit = cx.config.max_fetch_bytes;
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(fetch_error(url, format!("larger than {limit} bytes")));
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| fetch_error(url, err.to_string()))?;
        if body.len() + chunk.len() > limit {
            return Err(fetch_error(url, format!("larger than {limit} bytes")));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(SourceFile {
        name: display_name(url),
        media_type,
        data: Bytes::from(body),
        origin: SourceOrigin::Stored {
            url: url.to_string(),
        },
    })
}

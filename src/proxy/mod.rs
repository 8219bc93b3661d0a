//! Upstream chat-completion payload and client.

pub mod stream;

use std::collections::BTreeMap;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::intake::HistoryEntry;
use crate::{RelayError, Result};

pub use stream::{ProxyEvent, ProxySession, ProxyState, TextEventEncoder, relay};

pub const DEFAULT_PERSONA: &str =
    "You are a helpful assistant. Answer using the provided documents when they are relevant.";
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe this image.";
pub const HISTORY_TURNS: usize = 10;
pub const DEFAULT_API_KEY_ENV: &str = "DOC_RELAY_API_KEY";

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const ERROR_EXCERPT_CHARS: usize = 512;

/// How the upstream body is relayed to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// Upstream already speaks chat-completion chunk events; bytes pass through.
    #[default]
    Canonical,
    /// Upstream streams raw text; every chunk is wrapped into a chunk event.
    Text,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Environment variable holding the provider API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub format: StreamFormat,
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: u64,
    /// System prompt used when the caller supplies no `context`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key_env: Some(DEFAULT_API_KEY_ENV.to_string()),
            format: StreamFormat::Canonical,
            headers: BTreeMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            persona: None,
        }
    }
}

impl UpstreamConfig {
    pub fn persona(&self) -> &str {
        self.persona.as_deref().unwrap_or(DEFAULT_PERSONA)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(content.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

/// Builds the streamed chat-completion request: system prompt, the most recent
/// history turns, then the user turn with any image references.
pub fn build_payload(
    model: &str,
    system_prompt: &str,
    history: &[HistoryEntry],
    text: &str,
    images: &[String],
) -> UpstreamRequest {
    let mut messages = Vec::with_capacity(history.len().min(HISTORY_TURNS) + 2);
    messages.push(ChatMessage::text("system", system_prompt));

    let recent = &history[history.len().saturating_sub(HISTORY_TURNS)..];
    for entry in recent {
        let role = if entry.is_user() { "user" } else { "assistant" };
        messages.push(ChatMessage::text(role, entry.text.as_str()));
    }

    let user = if images.is_empty() {
        ChatMessage::text("user", text)
    } else {
        let prompt = if text.trim().is_empty() {
            DEFAULT_IMAGE_PROMPT
        } else {
            text
        };
        let mut parts = Vec::with_capacity(images.len() + 1);
        parts.push(ContentPart::Text {
            text: prompt.to_string(),
        });
        parts.extend(images.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        }));
        ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(parts),
        }
    };
    messages.push(user);

    UpstreamRequest {
        model: model.to_string(),
        messages,
        stream: true,
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    base_url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    api_key: Option<String>,
    format: StreamFormat,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url)
            .field("format", &self.format)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|err| RelayError::Internal(format!("upstream http client error: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            headers: HeaderMap::new(),
            api_key: None,
            format: StreamFormat::Canonical,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|err| RelayError::Internal(format!("upstream http client error: {err}")))?;
        let api_key = match config.api_key_env.as_deref() {
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => {
                    warn!(env = var, "upstream API key variable is unset; sending requests without one");
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            base_url: config.base_url.clone(),
            client,
            headers: parse_headers(&config.headers)?,
            api_key,
            format: config.format,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Result<Self> {
        self.headers = parse_headers(headers)?;
        Ok(self)
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn endpoint(&self) -> String {
        join_base_url(&self.base_url, CHAT_COMPLETIONS_PATH)
    }

    /// Sends the request and returns once upstream headers arrive. Non-2xx
    /// replies are logged with a body excerpt and surfaced without it.
    pub async fn open(
        &self,
        payload: &UpstreamRequest,
        session: &mut ProxySession,
    ) -> Result<reqwest::Response> {
        session.advance(ProxyEvent::RequestSent);

        let mut req = self
            .client
            .post(self.endpoint())
            .headers(self.headers.clone())
            .json(payload);
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }

        let response = match req.send().await {
            Ok(response) => response,
            Err(err) => {
                session.advance(ProxyEvent::UpstreamFailed);
                warn!(error = %err, "upstream request failed");
                return Err(RelayError::Upstream {
                    status: 503,
                    message: "upstream unavailable".to_string(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            session.advance(ProxyEvent::UpstreamFailed);
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(ERROR_EXCERPT_CHARS).collect();
            warn!(status = status.as_u16(), body = %excerpt, "upstream rejected request");
            let relay_status = if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                503
            } else {
                502
            };
            return Err(RelayError::Upstream {
                status: relay_status,
                message: format!("upstream returned {}", status.as_u16()),
            });
        }

        session.advance(ProxyEvent::HeadersReceived);
        Ok(response)
    }
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path_no_leading_slash = path.strip_prefix('/').unwrap_or(path);

    // base_url may already end in /v1.
    if base.ends_with("/v1") {
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }
    format!("{base}/{path_no_leading_slash}")
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let header_name = name
            .parse::<HeaderName>()
            .map_err(|_| RelayError::Internal(format!("invalid upstream header name: {name}")))?;
        let header_value = value
            .parse::<HeaderValue>()
            .map_err(|_| RelayError::Internal(format!("invalid upstream header value for {name}")))?;
        out.insert(header_name, header_value);
    }
    Ok(out)
}

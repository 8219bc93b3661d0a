//! Object storage for extracted images.
//!
//! The relay only needs `put` and `delete`. URLs returned by a store are
//! treated as opaque fetchable addresses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage rejected {operation} ({status})")]
    Rejected { operation: &'static str, status: u16 },
    #[error("storage misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, data: Bytes, media_type: &str) -> Result<String, StorageError>;

    async fn delete(&self, urls: &[String]) -> Result<(), StorageError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base URL of an HTTP blob service. Unset inlines images as `data:` URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the bearer token for the blob service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    /// Public URL prefix used when the service does not echo a URL back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
}

/// Encodes every object into a `data:` URL. Nothing is retained, so
/// `delete` has nothing to do.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineObjectStore;

#[async_trait]
impl ObjectStore for InlineObjectStore {
    async fn put(&self, _name: &str, data: Bytes, media_type: &str) -> Result<String, StorageError> {
        Ok(format!("data:{media_type};base64,{}", BASE64.encode(&data)))
    }

    async fn delete(&self, _urls: &[String]) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Keeps objects in process memory under `memory://` URLs. Test double.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (String, Bytes)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<(String, Bytes)> {
        self.objects.lock().await.get(url).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, name: &str, data: Bytes, media_type: &str) -> Result<String, StorageError> {
        let mut objects = self.objects.lock().await;
        let url = format!("memory://objects/{}", unique_object_name(name));
        objects.insert(url.clone(), (media_type.to_string(), data));
        Ok(url)
    }

    async fn delete(&self, urls: &[String]) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().await;
        for url in urls {
            objects.remove(url);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    url: Option<String>,
}

/// Talks to a blob service that accepts `PUT <base>/<name>` and
/// `DELETE <base>` with a JSON `{"urls": [...]}` body.
#[derive(Clone, Debug)]
pub struct HttpObjectStore {
    base_url: String,
    public_base_url: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            public_base_url: None,
            token: None,
            client,
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| StorageError::Config("storage.base_url is not set".to_string()))?;
        let mut store = Self::new(base_url)?;
        if let Some(token_env) = config.token_env.as_deref() {
            let token = std::env::var(token_env)
                .map_err(|_| StorageError::Config(format!("{token_env} is not set")))?;
            store = store.with_token(token);
        }
        if let Some(public) = config.public_base_url.clone() {
            store = store.with_public_base_url(public);
        }
        Ok(store)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, name: &str, data: Bytes, media_type: &str) -> Result<String, StorageError> {
        let object_name = unique_object_name(name);
        let url = format!("{}/{}", self.base_url, object_name);
        let response = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, media_type)
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Rejected {
                operation: "put",
                status: status.as_u16(),
            });
        }

        let echoed = response
            .json::<PutResponse>()
            .await
            .ok()
            .and_then(|body| body.url)
            .filter(|url| !url.trim().is_empty());
        Ok(echoed.unwrap_or_else(|| {
            let base = self.public_base_url.as_deref().unwrap_or(&self.base_url);
            format!("{base}/{object_name}")
        }))
    }

    async fn delete(&self, urls: &[String]) -> Result<(), StorageError> {
        if urls.is_empty() {
            return Ok(());
        }
        let response = self
            .authorize(self.client.delete(&self.base_url))
            .json(&serde_json::json!({ "urls": urls }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::Rejected {
                operation: "delete",
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Keeps object names path-safe: anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_object_name(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "object".to_string()
    } else {
        cleaned
    }
}

static OBJECT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sanitized name behind a `<millis>-<pid>-<seq>-` prefix, unique across
/// requests and relay processes sharing a bucket.
pub fn unique_object_name(name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let seq = OBJECT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{millis:x}-{:x}-{seq:x}-{}",
        std::process::id(),
        sanitize_object_name(name)
    )
}

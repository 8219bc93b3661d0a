//! Caller identity verification.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolves a bearer token to a stable user id.
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Static bearer token -> user id table.
    pub tokens: BTreeMap<String, String>,
    /// Token introspection endpoint; takes precedence over `tokens`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introspection_url: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("tokens", &format_args!("<{} redacted>", self.tokens.len()))
            .field("introspection_url", &self.introspection_url)
            .finish()
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    let (scheme, token) = raw.trim().split_once(' ').ok_or(AuthError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingToken);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

#[derive(Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: BTreeMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: BTreeMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    id: Option<String>,
    sub: Option<String>,
    user_id: Option<String>,
}

/// Forwards the bearer token to an introspection endpoint and reads the user
/// id from `id`, `sub` or `user_id` in its JSON reply.
#[derive(Clone, Debug)]
pub struct HttpIdentityVerifier {
    url: String,
    client: reqwest::Client,
}

impl HttpIdentityVerifier {
    pub fn new(url: impl Into<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidToken);
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!("status {status}")));
        }

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        body.id
            .or(body.sub)
            .or(body.user_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or(AuthError::InvalidToken)
    }
}

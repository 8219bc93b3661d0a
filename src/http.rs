//! HTTP surface: `POST /api/chat` and `GET /health`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, body};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::{self, AuthError, HttpIdentityVerifier, IdentityVerifier, StaticTokenVerifier};
use crate::config::RelayConfig;
use crate::extract::ExtractContext;
use crate::intake::{IncomingRequest, IntakeLimits};
use crate::limits::{RateLimitDecision, RateLimitStore, build_rate_limiter};
use crate::pipeline::Pipeline;
use crate::proxy::{ProxySession, UpstreamClient, relay};
use crate::storage::{HttpObjectStore, InlineObjectStore, ObjectStore};
use crate::{RelayError, Result};

pub const MODEL_HEADER: &str = "x-doc-relay-model";

#[derive(Clone)]
pub struct AppState {
    pipeline: Pipeline,
    intake: IntakeLimits,
    verifier: Arc<dyn IdentityVerifier>,
    rate_limiter: Arc<dyn RateLimitStore>,
    upstream: UpstreamClient,
}

impl AppState {
    pub fn new(
        pipeline: Pipeline,
        verifier: Arc<dyn IdentityVerifier>,
        rate_limiter: Arc<dyn RateLimitStore>,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            pipeline,
            intake: IntakeLimits::default(),
            verifier,
            rate_limiter,
            upstream,
        }
    }

    pub fn with_intake_limits(mut self, intake: IntakeLimits) -> Self {
        self.intake = intake;
        self
    }

    /// Wires every collaborator from configuration.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.storage.base_url {
            Some(_) => Arc::new(HttpObjectStore::from_config(&config.storage)?),
            None => {
                warn!("no storage.base_url configured; extracted images are inlined as data: URLs");
                Arc::new(InlineObjectStore)
            }
        };

        let verifier: Arc<dyn IdentityVerifier> = match config.auth.introspection_url.as_deref() {
            Some(url) => Arc::new(
                HttpIdentityVerifier::new(url).map_err(|err| RelayError::Internal(err.to_string()))?,
            ),
            None => {
                if config.auth.tokens.is_empty() {
                    warn!("no auth tokens configured; every request will be rejected");
                }
                Arc::new(StaticTokenVerifier::new(config.auth.tokens.clone()))
            }
        };

        let rate_limiter = build_rate_limiter(&config.rate_limit)?;
        let upstream = UpstreamClient::from_config(&config.upstream)?;

        let pipeline = Pipeline::new(Arc::clone(&store))
            .with_extract_context(ExtractContext::new(store, config.extraction_config()))
            .with_budgets(config.budget.clone())
            .with_models(config.models.clone())
            .with_persona(config.upstream.persona());

        Ok(Self::new(pipeline, verifier, rate_limiter, upstream)
            .with_intake_limits(config.intake.clone()))
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(handle_chat))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
        .into_response()
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

fn apply_quota_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    insert_header(headers, "x-ratelimit-limit", decision.limit);
    insert_header(headers, "x-ratelimit-remaining", decision.remaining);
    insert_header(headers, "x-ratelimit-reset", decision.reset_at_ms / 1000);
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::Validation { reason } => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request", reason)
            }
            err @ RelayError::UnsupportedMediaType { .. } => {
                error_response(StatusCode::BAD_REQUEST, "unsupported_media_type", err.to_string())
            }
            err @ RelayError::FileTooLarge { .. } => {
                error_response(StatusCode::PAYLOAD_TOO_LARGE, "file_too_large", err.to_string())
            }
            err @ (RelayError::AggregateTooLarge { .. } | RelayError::PayloadTooLarge { .. }) => {
                error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", err.to_string())
            }
            RelayError::Unauthorized(AuthError::Unavailable(detail)) => {
                error!(error = %detail, "identity service unavailable");
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "auth_unavailable",
                    "identity service unavailable",
                )
            }
            RelayError::Unauthorized(err) => {
                error_response(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
            }
            RelayError::QuotaExceeded {
                limit,
                retry_after_secs,
                reset_at_ms,
            } => {
                let mut response = error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    format!("rate limit exceeded: {limit} requests per window"),
                );
                let headers = response.headers_mut();
                insert_header(headers, "retry-after", retry_after_secs);
                apply_quota_headers(
                    headers,
                    &RateLimitDecision {
                        allowed: false,
                        limit,
                        remaining: 0,
                        reset_at_ms,
                        retry_after_secs,
                    },
                );
                response
            }
            RelayError::Upstream { status, message } => {
                let status = StatusCode::from_u16(status)
                    .ok()
                    .filter(|status| status.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                error_response(status, "upstream_error", message)
            }
            RelayError::Unavailable(detail) => {
                error!(error = %detail, "dependency unavailable");
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service_unavailable",
                    "service temporarily unavailable",
                )
            }
            RelayError::Internal(detail) => {
                error!(error = %detail, "internal error");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error",
                )
            }
        }
    }
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_body: Body,
) -> std::result::Result<Response, RelayError> {
    let token = auth::bearer_token(&headers)?;
    let user_id = state.verifier.verify(token).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| RelayError::validation("missing content-type"))?;
    let limit = state.intake.body_limit();
    let raw = body::to_bytes(request_body, limit)
        .await
        .map_err(|_| RelayError::PayloadTooLarge { limit })?;

    let request = IncomingRequest::from_multipart(content_type, &raw)?;
    drop(raw);
    request.validate(&state.intake)?;

    let decision = state.rate_limiter.allow(&user_id).await?;
    if !decision.allowed {
        info!(user_id = %user_id, "rate limit exceeded");
        return Err(RelayError::QuotaExceeded {
            limit: decision.limit,
            retry_after_secs: decision.retry_after_secs,
            reset_at_ms: decision.reset_at_ms,
        });
    }

    info!(
        user_id = %user_id,
        attachments = request.attachments.len(),
        context_files = request.context_file_urls.len(),
        task_type = ?request.task_type,
        "chat request admitted"
    );

    let prepared = state.pipeline.prepare(&request).await;
    let mut session = ProxySession::new(prepared.model.clone());
    let upstream = state.upstream.open(&prepared.payload, &mut session).await?;

    let body_stream = upstream
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let events = relay(body_stream, state.upstream.format(), session);

    let mut response = Response::new(Body::from_stream(events));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    apply_quota_headers(headers, &decision);
    insert_header(headers, MODEL_HEADER, &prepared.model);
    Ok(response)
}

use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("file {name} is {size} bytes, exceeding the {limit} byte limit")]
    FileTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },
    #[error("file {name} has unsupported type {media_type}")]
    UnsupportedMediaType { name: String, media_type: String },
    #[error("attachments total {total} bytes, exceeding the {limit} byte limit")]
    AggregateTooLarge { total: usize, limit: usize },
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("rate limit exceeded: {limit} requests per window")]
    QuotaExceeded {
        limit: u32,
        retry_after_secs: u64,
        reset_at_ms: u64,
    },
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<crate::limits::RateLimitError> for RelayError {
    fn from(err: crate::limits::RateLimitError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<crate::storage::StorageError> for RelayError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<crate::config::ConfigError> for RelayError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Internal(err.to_string())
    }
}

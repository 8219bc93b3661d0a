pub mod auth;
pub mod budget;
pub mod config;
mod error;
pub mod extract;
pub mod http;
pub mod intake;
pub mod limits;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod router;
pub mod storage;
pub mod utils;

pub use error::{RelayError, Result};

pub use auth::{AuthConfig, AuthError, HttpIdentityVerifier, IdentityVerifier, StaticTokenVerifier};
pub use budget::{BudgetConfig, Truncation, estimate_tokens, truncate};
pub use config::{ConfigError, RelayConfig};
pub use extract::{
    AssembledContent, ExtractContext, ExtractedContent, ExtractionConfig, ExtractionError,
    Extractor, ExtractorRegistry, SourceFile,
};
pub use http::{AppState, router};
pub use intake::{Attachment, HistoryEntry, IncomingRequest, IntakeLimits, TaskType};
pub use limits::{
    MemoryRateLimiter, RateLimitConfig, RateLimitDecision, RateLimitError, RateLimitStore,
    build_rate_limiter,
};
#[cfg(feature = "limits-redis")]
pub use limits::redis::RedisRateLimiter;
pub use pipeline::{Pipeline, PreparedRequest};
pub use proxy::{
    ProxyEvent, ProxySession, ProxyState, StreamFormat, UpstreamClient, UpstreamConfig,
    UpstreamRequest,
};
pub use router::{ModelKind, ModelsConfig};
pub use storage::{
    HttpObjectStore, InlineObjectStore, MemoryObjectStore, ObjectStore, StorageConfig, StorageError,
};

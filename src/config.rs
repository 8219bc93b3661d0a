//! Service configuration, read from TOML. Every section is optional.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthConfig;
use crate::budget::BudgetConfig;
use crate::extract::ExtractionConfig;
use crate::intake::IntakeLimits;
use crate::limits::RateLimitConfig;
use crate::proxy::UpstreamConfig;
use crate::router::ModelsConfig;
use crate::storage::StorageConfig;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: String,
    pub intake: IntakeLimits,
    pub extraction: ExtractionConfig,
    pub budget: BudgetConfig,
    pub rate_limit: RateLimitConfig,
    pub models: ModelsConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            intake: IntakeLimits::default(),
            extraction: ExtractionConfig::default(),
            budget: BudgetConfig::default(),
            rate_limit: RateLimitConfig::default(),
            models: ModelsConfig::default(),
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Extraction settings with context files limited to the storage
    /// locations when no `allowed_origins` are configured.
    pub fn extraction_config(&self) -> ExtractionConfig {
        let mut extraction = self.extraction.clone();
        if extraction.allowed_origins.is_empty() {
            extraction.allowed_origins = [&self.storage.public_base_url, &self.storage.base_url]
                .into_iter()
                .flatten()
                .cloned()
                .collect();
        }
        extraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::StreamFormat;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.intake.max_file_bytes, 25 * 1024 * 1024);
        assert_eq!(config.budget.total_tokens, 25_000);
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.extraction.max_sheet_rows, 1000);
        assert_eq!(config.upstream.format, StreamFormat::Canonical);
    }

    #[test]
    fn sections_override_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
listen = "0.0.0.0:9000"

[rate_limit]
max_requests = 5
redis_url = "redis://cache:6379/"

[models]
code = "coder-large"

[upstream]
base_url = "http://llm.internal/v1"
format = "text"
headers = { "x-tenant" = "docs" }

[auth.tokens]
"tok-1" = "alice"
"#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.redis_url.as_deref(), Some("redis://cache:6379/"));
        assert_eq!(config.models.code, "coder-large");
        assert_eq!(config.models.general, ModelsConfig::default().general);
        assert_eq!(config.upstream.format, StreamFormat::Text);
        assert_eq!(config.upstream.headers["x-tenant"], "docs");
        assert_eq!(config.auth.tokens["tok-1"], "alice");
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = RelayConfig::from_toml_str("[upstream]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RelayConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn context_origins_default_to_storage_locations() {
        let config = RelayConfig::from_toml_str(
            r#"
[storage]
base_url = "http://blobs.internal/files"
public_base_url = "https://cdn.example/files"
"#,
        )
        .unwrap();
        assert_eq!(
            config.extraction_config().allowed_origins,
            ["https://cdn.example/files", "http://blobs.internal/files"]
        );

        let config = RelayConfig::from_toml_str(
            r#"
[extraction]
allowed_origins = ["https://docs.example/shared"]

[storage]
base_url = "http://blobs.internal/files"
"#,
        )
        .unwrap();
        assert_eq!(
            config.extraction_config().allowed_origins,
            ["https://docs.example/shared"]
        );

        assert!(RelayConfig::default().extraction_config().allowed_origins.is_empty());
    }
}

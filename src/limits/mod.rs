//! Per-user request admission.
//!
//! Windows are fixed: the first request after a window has expired opens a new
//! one lasting `window_secs`. The redis store is the primary implementation so
//! that several relay instances share counts; the in-process store is a
//! fallback for single-instance deployments and tests.

#[cfg(feature = "limits-redis")]
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::utils::task::{AbortOnDrop, spawn_periodic};

pub const DEFAULT_MAX_REQUESTS: u32 = 20;
pub const DEFAULT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
    pub retry_after_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_prefix: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_secs: DEFAULT_WINDOW_SECS,
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            redis_url: None,
            redis_prefix: None,
        }
    }
}

impl RateLimitConfig {
    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000).max(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
    pub retry_after_secs: u64,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store error: {0}")]
    Store(String),
    #[error("rate limit store misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn allow(&self, user_id: &str) -> Result<RateLimitDecision, RateLimitError>;
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        now_millis()
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    reset_at_ms: u64,
}

fn admit(
    windows: &mut HashMap<String, Window>,
    user_id: &str,
    now_ms: u64,
    config: &RateLimitConfig,
) -> RateLimitDecision {
    let limit = config.max_requests;
    let rejected = |reset_at_ms: u64| RateLimitDecision {
        allowed: false,
        limit,
        remaining: 0,
        reset_at_ms,
        retry_after_secs: config.retry_after_secs,
    };

    if limit == 0 {
        return rejected(now_ms.saturating_add(config.window_ms()));
    }

    let window = match windows.get_mut(user_id) {
        Some(window) if now_ms <= window.reset_at_ms => window,
        _ => {
            let reset_at_ms = now_ms.saturating_add(config.window_ms());
            windows.insert(
                user_id.to_string(),
                Window {
                    count: 1,
                    reset_at_ms,
                },
            );
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit - 1,
                reset_at_ms,
                retry_after_secs: 0,
            };
        }
    };

    if window.count >= limit {
        return rejected(window.reset_at_ms);
    }

    window.count += 1;
    RateLimitDecision {
        allowed: true,
        limit,
        remaining: limit - window.count,
        reset_at_ms: window.reset_at_ms,
        retry_after_secs: 0,
    }
}

fn sweep(windows: &mut HashMap<String, Window>, now_ms: u64) -> usize {
    let before = windows.len();
    windows.retain(|_, window| now_ms <= window.reset_at_ms);
    before - windows.len()
}

/// Single-process fallback. Counts are not shared between relay instances.
pub struct MemoryRateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, Window>>>,
    clock: Arc<dyn Clock>,
    _sweeper: Option<AbortOnDrop>,
}

impl MemoryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        warn!(
            max_requests = config.max_requests,
            window_secs = config.window_secs,
            "rate limiting in degraded in-process mode; limits are not shared across instances"
        );
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
            clock,
            _sweeper: None,
        }
    }

    /// Starts the background task that drops expired windows. A no-op outside
    /// a Tokio runtime.
    pub fn with_sweeper(mut self) -> Self {
        let windows = Arc::clone(&self.windows);
        let clock = Arc::clone(&self.clock);
        let period = Duration::from_millis(self.config.window_ms());
        self._sweeper = spawn_periodic(period, move || {
            let windows = Arc::clone(&windows);
            let clock = Arc::clone(&clock);
            async move {
                let removed = sweep(&mut *windows.lock().await, clock.now_millis());
                if removed > 0 {
                    debug!(removed, "swept expired rate limit windows");
                }
            }
        });
        self
    }

    pub async fn sweep_expired(&self) -> usize {
        sweep(&mut *self.windows.lock().await, self.clock.now_millis())
    }

    pub async fn tracked_users(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimiter {
    async fn allow(&self, user_id: &str) -> Result<RateLimitDecision, RateLimitError> {
        let now_ms = self.clock.now_millis();
        let mut windows = self.windows.lock().await;
        Ok(admit(&mut windows, user_id, now_ms, &self.config))
    }
}

/// Picks the redis store when a URL is configured, the in-process store otherwise.
pub fn build_rate_limiter(
    config: &RateLimitConfig,
) -> Result<Arc<dyn RateLimitStore>, RateLimitError> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "limits-redis")]
        Some(url) => {
            let mut store = self::redis::RedisRateLimiter::new(url, config.clone())?;
            if let Some(prefix) = config.redis_prefix.as_deref() {
                store = store.with_prefix(prefix);
            }
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "limits-redis"))]
        Some(_) => Err(RateLimitError::Config(
            "redis rate limiting requires `--features limits-redis`".to_string(),
        )),
        None => Ok(Arc::new(
            MemoryRateLimiter::new(config.clone()).with_sweeper(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn limiter(clock: Arc<ManualClock>) -> MemoryRateLimiter {
        MemoryRateLimiter::with_clock(
            RateLimitConfig {
                max_requests: 20,
                window_secs: 60,
                ..RateLimitConfig::default()
            },
            clock,
        )
    }

    #[tokio::test]
    async fn twenty_first_request_in_window_is_rejected() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(Arc::clone(&clock));

        for expected_remaining in (0..20).rev() {
            let decision = limiter.allow("alice").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let rejected = limiter.allow("alice").await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.limit, 20);
        assert_eq!(rejected.retry_after_secs, DEFAULT_RETRY_AFTER_SECS);
        assert_eq!(rejected.reset_at_ms, 60_000);
    }

    #[tokio::test]
    async fn new_window_starts_after_reset() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(Arc::clone(&clock));
        for _ in 0..21 {
            limiter.allow("alice").await.unwrap();
        }

        clock.advance(60_000);
        assert!(!limiter.allow("alice").await.unwrap().allowed);

        clock.advance(1);
        let decision = limiter.allow("alice").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 19);
        assert_eq!(decision.reset_at_ms, 120_001);
    }

    #[tokio::test]
    async fn users_are_counted_independently() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(clock);
        for _ in 0..20 {
            limiter.allow("alice").await.unwrap();
        }
        assert!(!limiter.allow("alice").await.unwrap().allowed);
        assert!(limiter.allow("bob").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn zero_limit_rejects_everything() {
        let limiter = MemoryRateLimiter::with_clock(
            RateLimitConfig {
                max_requests: 0,
                ..RateLimitConfig::default()
            },
            Arc::new(ManualClock::default()),
        );
        assert!(!limiter.allow("alice").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_windows() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(Arc::clone(&clock));
        limiter.allow("early").await.unwrap();
        clock.advance(30_000);
        limiter.allow("late").await.unwrap();
        clock.advance(30_001);

        assert_eq!(limiter.sweep_expired().await, 1);
        assert_eq!(limiter.tracked_users().await, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_never_exceed_limit() {
        let limiter = Arc::new(limiter(Arc::new(ManualClock::default())));
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let limiter = Arc::clone(&limiter);
            tasks.push(tokio::spawn(async move {
                limiter.allow("racer").await.unwrap().allowed
            }));
        }
        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }

    #[tokio::test]
    async fn builder_falls_back_to_memory_store() {
        let store = build_rate_limiter(&RateLimitConfig::default()).unwrap();
        assert!(store.allow("someone").await.unwrap().allowed);
    }
}

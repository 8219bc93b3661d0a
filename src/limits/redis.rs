use async_trait::async_trait;

use super::{RateLimitConfig, RateLimitDecision, RateLimitError, RateLimitStore, now_millis};

// returns {allowed, count, ttl_ms}; a rejected call never increments.
const ADMIT_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

local current = tonumber(redis.call("GET", KEYS[1]) or "0")
if current >= limit then
  local ttl = redis.call("PTTL", KEYS[1])
  if ttl < 0 then
    redis.call("PEXPIRE", KEYS[1], window_ms)
    ttl = window_ms
  end
  return {0, current, ttl}
end

local count = redis.call("INCR", KEYS[1])
if count == 1 then
  redis.call("PEXPIRE", KEYS[1], window_ms)
end
local ttl = redis.call("PTTL", KEYS[1])
if ttl < 0 then
  redis.call("PEXPIRE", KEYS[1], window_ms)
  ttl = window_ms
end
return {1, count, ttl}
"#;

#[derive(Clone, Debug)]
pub struct RedisRateLimiter {
    client: redis::Client,
    prefix: String,
    config: RateLimitConfig,
}

impl RedisRateLimiter {
    pub fn new(url: impl AsRef<str>, config: RateLimitConfig) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url.as_ref())
            .map_err(|err| RateLimitError::Config(format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            prefix: "doc_relay".to_string(),
            config,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key_rate_limit(&self, user_id: &str) -> String {
        format!("{}:rate_limit:{user_id}", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, RateLimitError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| RateLimitError::Store(format!("redis error: {err}")))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimiter {
    async fn allow(&self, user_id: &str) -> Result<RateLimitDecision, RateLimitError> {
        let limit = self.config.max_requests;
        let window_ms = self.config.window_ms();
        if limit == 0 {
            return Ok(RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at_ms: now_millis().saturating_add(window_ms),
                retry_after_secs: self.config.retry_after_secs,
            });
        }

        let mut conn = self.connection().await?;
        let reply: Vec<i64> = redis::Script::new(ADMIT_SCRIPT)
            .key(self.key_rate_limit(user_id))
            .arg(i64::from(limit))
            .arg(i64::try_from(window_ms).unwrap_or(i64::MAX))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| RateLimitError::Store(format!("redis error: {err}")))?;

        let &[allowed, count, ttl_ms] = reply.as_slice() else {
            return Err(RateLimitError::Store(format!(
                "unexpected rate limit script response: {reply:?}"
            )));
        };

        let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        let reset_at_ms = now_millis().saturating_add(ttl_ms.max(0) as u64);
        if allowed == 1 {
            Ok(RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(count),
                reset_at_ms,
                retry_after_secs: 0,
            })
        } else {
            Ok(RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at_ms,
                retry_after_secs: self.config.retry_after_secs,
            })
        }
    }
}

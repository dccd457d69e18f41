//! Per-origin token bucket backed by the ephemeral store.
//!
//! The read/compute/write of the bucket hash must be serializable per key, so
//! the whole update runs as one server-side Lua script. Buckets idle for an
//! hour expire.

use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;

const BUCKET_TTL_SECS: u64 = 3600;

/// Atomic bucket update: refill by elapsed time, then take one token if at
/// least one is available. Returns 1 when the request is admitted.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(bucket[1]) or capacity
local last = tonumber(bucket[2]) or now

tokens = math.min(capacity, tokens + math.max(0, now - last) * refill_per_sec)

local allowed = 0
if tokens >= 1.0 then
    tokens = tokens - 1.0
    allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last', now)
redis.call('EXPIRE', KEYS[1], ttl)
return allowed
"#;

/// Admission decision per origin. Trait seam so tests can substitute an
/// in-memory bucket with a controllable clock.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Returns false when the origin's bucket is drained. Errors are store
    /// failures and fail the request; see the error handling policy.
    async fn admit(&self, origin: &str, capacity: u32, refill_per_sec: f64) -> Result<bool>;
}

pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: Script,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn admit(&self, origin: &str, capacity: u32, refill_per_sec: f64) -> Result<bool> {
        let key = format!("rl:{}", origin);
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;

        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .script
            .key(&key)
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(now)
            .arg(BUCKET_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        Ok(allowed == 1)
    }
}

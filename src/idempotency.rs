//! Short-lived key→reply memo for reply stability.
//!
//! The memo stores the reply bytes actually sent, and a hit is returned
//! verbatim regardless of any other guard's current state. Keys are
//! untrusted opaque client strings.

use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub const DEFAULT_MEMO_TTL_SECS: u64 = 300;

#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    /// Returns the memoed reply body, if any.
    async fn lookup(&self, key: &str) -> Result<Option<String>>;

    /// Stores the exact reply body under the key for `ttl_secs`.
    async fn memo(&self, key: &str, reply: &str, ttl_secs: u64) -> Result<()>;
}

pub struct RedisIdempotencyCache {
    conn: ConnectionManager,
}

impl RedisIdempotencyCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn cache_key(key: &str) -> String {
        format!("idem:{}", key)
    }
}

#[async_trait]
impl IdempotencyCache for RedisIdempotencyCache {
    async fn lookup(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = conn.get(Self::cache_key(key)).await?;
        Ok(reply)
    }

    async fn memo(&self, key: &str, reply: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::cache_key(key), reply, ttl_secs)
            .await?;
        Ok(())
    }
}

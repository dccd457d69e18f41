//! One-shot nonce admission per (event, nonce).
//!
//! Atomic set-if-absent with a 12-hour TTL: long enough to cover an event
//! day, bounded so the ephemeral store does not accumulate nonces forever.

use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;

const NONCE_TTL_SECS: u64 = 12 * 60 * 60;

#[async_trait]
pub trait ReplayGuard: Send + Sync {
    /// Returns true exactly once across all calls for a given
    /// (event_id, nonce); every later call returns false.
    async fn claim(&self, event_id: &str, nonce: &str) -> Result<bool>;
}

pub struct RedisReplayGuard {
    conn: ConnectionManager,
}

impl RedisReplayGuard {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ReplayGuard for RedisReplayGuard {
    async fn claim(&self, event_id: &str, nonce: &str) -> Result<bool> {
        let key = format!("replay:{}:{}", event_id, nonce);
        let mut conn = self.conn.clone();

        // SET NX EX in one round trip; only the first caller sees OK
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(NONCE_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        Ok(claimed.is_some())
    }
}

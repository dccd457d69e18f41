//! Deferred-decision queue and offline flag.
//!
//! While the gate is offline (operator flag or durable-store failure),
//! decisions that would have committed a redemption are appended to an
//! ordered stream instead. The reconciler worker drains the stream with a
//! resumable cursor persisted in the same ephemeral store.

use crate::error::{GateError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

pub const OFFLINE_STREAM_KEY: &str = "offline_validations";
pub const WORKER_CURSOR_KEY: &str = "worker:last_id";
pub const OFFLINE_FLAG_KEY: &str = "cfg:offline_mode";
pub const INITIAL_CURSOR: &str = "0-0";

/// One deferred decision awaiting reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedValidation {
    pub decision_id: String,
    pub event_id: String,
    pub ticket_id: String,
    pub ip: String,
    pub ua: String,
}

/// Read side of the operator-set offline flag. The flag itself is written by
/// an external surface; the gate only consults it.
#[async_trait]
pub trait OfflineFlag: Send + Sync {
    async fn is_offline(&self) -> Result<bool>;
}

/// Append-only ordered stream of deferred decisions with a resumable cursor
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Appends an entry; returns the store-assigned monotonic stream id.
    async fn enqueue(&self, entry: &QueuedValidation) -> Result<String>;

    /// Yields the next batch of entries with id > cursor, blocking up to
    /// `block_ms` when the stream is empty.
    async fn read_batch(
        &self,
        cursor: &str,
        max: usize,
        block_ms: usize,
    ) -> Result<Vec<(String, QueuedValidation)>>;

    /// Removes a durably processed entry.
    async fn ack(&self, id: &str) -> Result<()>;

    async fn cursor_load(&self) -> Result<String>;

    async fn cursor_save(&self, id: &str) -> Result<()>;
}

pub struct RedisOfflineQueue {
    conn: ConnectionManager,
    default_offline: bool,
}

impl RedisOfflineQueue {
    pub fn new(conn: ConnectionManager, default_offline: bool) -> Self {
        Self {
            conn,
            default_offline,
        }
    }
}

fn entry_from_stream_id(id: &StreamId) -> Result<QueuedValidation> {
    let required = |field: &str| -> Result<String> {
        id.get::<String>(field)
            .ok_or_else(|| GateError::MalformedQueueEntry(format!("missing field '{}' in {}", field, id.id)))
    };

    Ok(QueuedValidation {
        decision_id: required("decision_id")?,
        event_id: required("event_id")?,
        ticket_id: required("ticket_id")?,
        ip: id.get::<String>("ip").unwrap_or_else(|| "unknown".to_string()),
        ua: id.get::<String>("ua").unwrap_or_default(),
    })
}

#[async_trait]
impl OfflineFlag for RedisOfflineQueue {
    async fn is_offline(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let flag: Option<String> = conn.get(OFFLINE_FLAG_KEY).await?;
        Ok(match flag {
            Some(value) => value.eq_ignore_ascii_case("true"),
            None => self.default_offline,
        })
    }
}

#[async_trait]
impl OfflineQueue for RedisOfflineQueue {
    async fn enqueue(&self, entry: &QueuedValidation) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(
                OFFLINE_STREAM_KEY,
                "*",
                &[
                    ("decision_id", entry.decision_id.as_str()),
                    ("event_id", entry.event_id.as_str()),
                    ("ticket_id", entry.ticket_id.as_str()),
                    ("ip", entry.ip.as_str()),
                    ("ua", entry.ua.as_str()),
                ],
            )
            .await?;
        Ok(id)
    }

    async fn read_batch(
        &self,
        cursor: &str,
        max: usize,
        block_ms: usize,
    ) -> Result<Vec<(String, QueuedValidation)>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default().count(max).block(block_ms);
        // A blocked read that times out replies nil; treat it as an empty batch
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[OFFLINE_STREAM_KEY], &[cursor], &options)
            .await?;
        let reply = reply.unwrap_or_default();

        let mut batch = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let entry = entry_from_stream_id(&id)?;
                batch.push((id.id, entry));
            }
        }
        Ok(batch)
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = conn.xdel(OFFLINE_STREAM_KEY, &[id]).await?;
        Ok(())
    }

    async fn cursor_load(&self) -> Result<String> {
        let mut conn = self.conn.clone();
        let cursor: Option<String> = conn.get(WORKER_CURSOR_KEY).await?;
        Ok(cursor.unwrap_or_else(|| INITIAL_CURSOR.to_string()))
    }

    async fn cursor_save(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(WORKER_CURSOR_KEY, id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;
    use std::collections::HashMap;

    fn stream_id(id: &str, fields: &[(&str, &str)]) -> StreamId {
        let mut map = HashMap::new();
        for (field, value) in fields {
            map.insert(field.to_string(), Value::Data(value.as_bytes().to_vec()));
        }
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    #[test]
    fn entry_parses_with_defaults_for_ambient_fields() {
        let id = stream_id(
            "1-0",
            &[
                ("decision_id", "d1"),
                ("event_id", "e1"),
                ("ticket_id", "t1"),
            ],
        );
        let entry = entry_from_stream_id(&id).unwrap();
        assert_eq!(entry.decision_id, "d1");
        assert_eq!(entry.ip, "unknown");
        assert_eq!(entry.ua, "");
    }

    #[test]
    fn entry_without_ticket_is_rejected() {
        let id = stream_id("1-0", &[("decision_id", "d1"), ("event_id", "e1")]);
        assert!(entry_from_stream_id(&id).is_err());
    }
}

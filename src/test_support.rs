//! In-memory fakes standing in for the ephemeral and durable stores, wired
//! through the same component traits the production handles implement. The
//! rate limiter carries a manual clock so refill behavior is deterministic,
//! and the durable fake can simulate an outage.

use crate::database::{AuditRecord, CommitOutcome, RedemptionStore, Ticket};
use crate::error::{GateError, Result};
use crate::idempotency::IdempotencyCache;
use crate::offline::{OfflineFlag, OfflineQueue, QueuedValidation, INITIAL_CURSOR};
use crate::rate_limit::RateLimiter;
use crate::replay::ReplayGuard;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

fn cache_outage() -> GateError {
    GateError::Cache(redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "simulated cache outage",
    )))
}

fn database_outage() -> GateError {
    GateError::Database(sqlx::Error::PoolTimedOut)
}

pub struct MemoryRateLimiter {
    buckets: Mutex<HashMap<String, (f64, f64)>>,
    clock: Mutex<f64>,
    fail: AtomicBool,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock: Mutex::new(0.0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn advance(&self, secs: f64) {
        *self.clock.lock().unwrap() += secs;
    }

    pub fn fail(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn admit(&self, origin: &str, capacity: u32, refill_per_sec: f64) -> Result<bool> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(cache_outage());
        }

        let now = *self.clock.lock().unwrap();
        let mut buckets = self.buckets.lock().unwrap();
        let (tokens, last) = buckets
            .get(origin)
            .copied()
            .unwrap_or((capacity as f64, now));

        let mut tokens = (capacity as f64).min(tokens + (now - last).max(0.0) * refill_per_sec);
        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }
        buckets.insert(origin.to_string(), (tokens, now));
        Ok(allowed)
    }
}

#[derive(Default)]
pub struct MemoryIdempotencyCache {
    replies: Mutex<HashMap<String, String>>,
}

impl MemoryIdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn lookup(&self, key: &str) -> Result<Option<String>> {
        Ok(self.replies.lock().unwrap().get(key).cloned())
    }

    async fn memo(&self, key: &str, reply: &str, _ttl_secs: u64) -> Result<()> {
        self.replies
            .lock()
            .unwrap()
            .insert(key.to_string(), reply.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryReplayGuard {
    seen: Mutex<HashSet<(String, String)>>,
}

impl MemoryReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ReplayGuard for MemoryReplayGuard {
    async fn claim(&self, event_id: &str, nonce: &str) -> Result<bool> {
        Ok(self
            .seen
            .lock()
            .unwrap()
            .insert((event_id.to_string(), nonce.to_string())))
    }
}

struct QueueInner {
    entries: Vec<(u64, QueuedValidation)>,
    next_seq: u64,
    cursor: String,
}

pub struct MemoryOfflineQueue {
    inner: Mutex<QueueInner>,
    offline: AtomicBool,
}

fn stream_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn seq_of(id: &str) -> u64 {
    id.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

impl MemoryOfflineQueue {
    pub fn new(offline: bool) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: Vec::new(),
                next_seq: 1,
                cursor: INITIAL_CURSOR.to_string(),
            }),
            offline: AtomicBool::new(offline),
        }
    }

    pub fn set_offline(&self, on: bool) {
        self.offline.store(on, Ordering::SeqCst);
    }

    pub fn pending(&self) -> Vec<QueuedValidation> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn last_assigned_id(&self) -> String {
        stream_id(self.inner.lock().unwrap().next_seq - 1)
    }
}

#[async_trait]
impl OfflineFlag for MemoryOfflineQueue {
    async fn is_offline(&self) -> Result<bool> {
        Ok(self.offline.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl OfflineQueue for MemoryOfflineQueue {
    async fn enqueue(&self, entry: &QueuedValidation) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push((seq, entry.clone()));
        Ok(stream_id(seq))
    }

    async fn read_batch(
        &self,
        cursor: &str,
        max: usize,
        _block_ms: usize,
    ) -> Result<Vec<(String, QueuedValidation)>> {
        let after = seq_of(cursor);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(max)
            .map(|(seq, entry)| (stream_id(*seq), entry.clone()))
            .collect())
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let seq = seq_of(id);
        self.inner
            .lock()
            .unwrap()
            .entries
            .retain(|(entry_seq, _)| *entry_seq != seq);
        Ok(())
    }

    async fn cursor_load(&self) -> Result<String> {
        Ok(self.inner.lock().unwrap().cursor.clone())
    }

    async fn cursor_save(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().cursor = id.to_string();
        Ok(())
    }
}

#[derive(Default)]
struct StoreInner {
    tickets: HashMap<String, Ticket>,
    redemptions: HashSet<(String, String)>,
    audits: Vec<AuditRecord>,
}

#[derive(Default)]
pub struct MemoryRedemptionStore {
    inner: Mutex<StoreInner>,
    fail_commits: AtomicBool,
    fail_fetches: AtomicBool,
}

impl MemoryRedemptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stand-in for the external provisioning surface
    pub fn insert_ticket(&self, id: &str, event_id: &str, org_id: &str) {
        self.inner.lock().unwrap().tickets.insert(
            id.to_string(),
            Ticket {
                id: id.to_string(),
                event_id: event_id.to_string(),
                org_id: org_id.to_string(),
            },
        );
    }

    /// Seed a prior redemption without going through the pipeline
    pub fn redeem(&self, ticket_id: &str, event_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .redemptions
            .insert((ticket_id.to_string(), event_id.to_string()));
    }

    pub fn fail_commits(&self, on: bool) {
        self.fail_commits.store(on, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, on: bool) {
        self.fail_fetches.store(on, Ordering::SeqCst);
    }

    pub fn audits(&self) -> Vec<AuditRecord> {
        self.inner.lock().unwrap().audits.clone()
    }

    pub fn redemption_count(&self, ticket_id: &str, event_id: &str) -> usize {
        if self
            .inner
            .lock()
            .unwrap()
            .redemptions
            .contains(&(ticket_id.to_string(), event_id.to_string()))
        {
            1
        } else {
            0
        }
    }
}

#[async_trait]
impl RedemptionStore for MemoryRedemptionStore {
    async fn fetch_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(database_outage());
        }
        Ok(self.inner.lock().unwrap().tickets.get(ticket_id).cloned())
    }

    async fn commit_redemption(
        &self,
        ticket_id: &str,
        event_id: &str,
        decision_id: &str,
        ip: &str,
        user_agent: &str,
        reason: crate::dto::ReasonCode,
    ) -> Result<CommitOutcome> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(database_outage());
        }

        let mut inner = self.inner.lock().unwrap();
        if !inner
            .redemptions
            .insert((ticket_id.to_string(), event_id.to_string()))
        {
            return Ok(CommitOutcome::Duplicate);
        }

        inner.audits.push(AuditRecord {
            decision_id: decision_id.to_string(),
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            event_id: event_id.to_string(),
            ticket_id: Some(ticket_id.to_string()),
            status: crate::dto::DecisionStatus::Accepted,
            reason,
        });
        Ok(CommitOutcome::Committed)
    }

    async fn record_decision(&self, record: &AuditRecord) -> Result<()> {
        self.inner.lock().unwrap().audits.push(record.clone());
        Ok(())
    }
}

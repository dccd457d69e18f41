//! Reconciler worker: drains the offline queue once the gate is back online.
//!
//! At-least-once drain: an entry is re-delivered if the process dies between
//! commit and cursor persistence, and the durable uniqueness constraint
//! turns the duplicate into REPLAY_ON_SYNC. The cursor is only advanced
//! after the entry has been settled and acked.

use crate::database::{AuditRecord, CommitOutcome, RedemptionStore};
use crate::dto::{DecisionStatus, ReasonCode};
use crate::error::Result;
use crate::offline::{OfflineFlag, OfflineQueue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DRAIN_BATCH_SIZE: usize = 50;
const DRAIN_BLOCK_MS: usize = 5000;
const OFFLINE_POLL: Duration = Duration::from_secs(1);
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

pub struct ReconcilerWorker {
    queue: Arc<dyn OfflineQueue>,
    flag: Arc<dyn OfflineFlag>,
    store: Arc<dyn RedemptionStore>,
}

impl ReconcilerWorker {
    pub fn new(
        queue: Arc<dyn OfflineQueue>,
        flag: Arc<dyn OfflineFlag>,
        store: Arc<dyn RedemptionStore>,
    ) -> Self {
        Self { queue, flag, store }
    }

    /// Run forever. Store failures leave the current entry queued and retry
    /// after a short backoff; nothing is lost and nothing is skipped.
    pub async fn run(self) {
        info!("Reconciler worker started");
        loop {
            if let Err(err) = self.tick().await {
                error!(error = %err, "drain interrupted, backing off");
                tokio::time::sleep(FAILURE_BACKOFF).await;
            }
        }
    }

    /// One drain round: settle at most one batch. Returns the number of
    /// entries settled.
    pub async fn tick(&self) -> Result<usize> {
        if self.flag.is_offline().await? {
            tokio::time::sleep(OFFLINE_POLL).await;
            return Ok(0);
        }

        let cursor = self.queue.cursor_load().await?;
        let batch = self
            .queue
            .read_batch(&cursor, DRAIN_BATCH_SIZE, DRAIN_BLOCK_MS)
            .await?;

        let mut settled = 0;
        for (id, entry) in batch {
            let outcome = self
                .store
                .commit_redemption(
                    &entry.ticket_id,
                    &entry.event_id,
                    &entry.decision_id,
                    &entry.ip,
                    &entry.ua,
                    ReasonCode::OkSynced,
                )
                .await?;

            match outcome {
                CommitOutcome::Committed => {
                    info!(
                        decision_id = %entry.decision_id,
                        ticket_id = %entry.ticket_id,
                        event_id = %entry.event_id,
                        "queued redemption synced"
                    );
                }
                CommitOutcome::Duplicate => {
                    warn!(
                        decision_id = %entry.decision_id,
                        ticket_id = %entry.ticket_id,
                        event_id = %entry.event_id,
                        "queued redemption collided with existing redemption"
                    );
                    self.store
                        .record_decision(&AuditRecord {
                            decision_id: entry.decision_id.clone(),
                            ip: entry.ip.clone(),
                            user_agent: entry.ua.clone(),
                            event_id: entry.event_id.clone(),
                            ticket_id: Some(entry.ticket_id.clone()),
                            status: DecisionStatus::Rejected,
                            reason: ReasonCode::ReplayOnSync,
                        })
                        .await?;
                }
            }

            // Ack before persisting the cursor: a crash in between re-delivers
            // this entry, and the uniqueness constraint settles the duplicate.
            self.queue.ack(&id).await?;
            self.queue.cursor_save(&id).await?;
            settled += 1;
        }

        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::QueuedValidation;
    use crate::test_support::{MemoryOfflineQueue, MemoryRedemptionStore};

    fn entry(decision_id: &str, ticket_id: &str) -> QueuedValidation {
        QueuedValidation {
            decision_id: decision_id.to_string(),
            event_id: "evt_1".to_string(),
            ticket_id: ticket_id.to_string(),
            ip: "10.0.0.1".to_string(),
            ua: "scanner/1.0".to_string(),
        }
    }

    fn worker(
        queue: &Arc<MemoryOfflineQueue>,
        store: &Arc<MemoryRedemptionStore>,
    ) -> ReconcilerWorker {
        ReconcilerWorker::new(queue.clone(), queue.clone(), store.clone())
    }

    #[tokio::test]
    async fn drains_queue_into_synced_redemptions() {
        let queue = Arc::new(MemoryOfflineQueue::new(false));
        let store = Arc::new(MemoryRedemptionStore::new());
        store.insert_ticket("t1", "evt_1", "org_1");
        store.insert_ticket("t2", "evt_1", "org_1");

        queue.enqueue(&entry("d1", "t1")).await.unwrap();
        queue.enqueue(&entry("d2", "t2")).await.unwrap();

        let settled = worker(&queue, &store).tick().await.unwrap();
        assert_eq!(settled, 2);

        assert_eq!(store.redemption_count("t1", "evt_1"), 1);
        assert_eq!(store.redemption_count("t2", "evt_1"), 1);
        let synced: Vec<_> = store
            .audits()
            .into_iter()
            .filter(|a| a.reason == ReasonCode::OkSynced)
            .collect();
        assert_eq!(synced.len(), 2);
        assert!(queue.pending().is_empty());
        assert_eq!(queue.cursor_load().await.unwrap(), queue.last_assigned_id());
    }

    #[tokio::test]
    async fn duplicate_redemption_becomes_replay_on_sync() {
        let queue = Arc::new(MemoryOfflineQueue::new(false));
        let store = Arc::new(MemoryRedemptionStore::new());
        store.insert_ticket("t1", "evt_1", "org_1");
        store.redeem("t1", "evt_1");

        queue.enqueue(&entry("d-pending", "t1")).await.unwrap();

        let settled = worker(&queue, &store).tick().await.unwrap();
        assert_eq!(settled, 1);

        assert_eq!(store.redemption_count("t1", "evt_1"), 1);
        let audits = store.audits();
        let replayed: Vec<_> = audits
            .iter()
            .filter(|a| a.decision_id == "d-pending")
            .collect();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].status, DecisionStatus::Rejected);
        assert_eq!(replayed[0].reason, ReasonCode::ReplayOnSync);
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn store_failure_halts_drain_without_advancing() {
        let queue = Arc::new(MemoryOfflineQueue::new(false));
        let store = Arc::new(MemoryRedemptionStore::new());
        store.insert_ticket("t1", "evt_1", "org_1");
        store.fail_commits(true);

        queue.enqueue(&entry("d1", "t1")).await.unwrap();
        let cursor_before = queue.cursor_load().await.unwrap();

        assert!(worker(&queue, &store).tick().await.is_err());

        assert_eq!(queue.pending().len(), 1);
        assert_eq!(queue.cursor_load().await.unwrap(), cursor_before);
        assert_eq!(store.redemption_count("t1", "evt_1"), 0);

        // Store recovers; the same entry settles on the next round
        store.fail_commits(false);
        assert_eq!(worker(&queue, &store).tick().await.unwrap(), 1);
        assert_eq!(store.redemption_count("t1", "evt_1"), 1);
    }

    #[tokio::test]
    async fn drain_pauses_while_offline() {
        let queue = Arc::new(MemoryOfflineQueue::new(true));
        let store = Arc::new(MemoryRedemptionStore::new());
        store.insert_ticket("t1", "evt_1", "org_1");

        queue.enqueue(&entry("d1", "t1")).await.unwrap();

        assert_eq!(worker(&queue, &store).tick().await.unwrap(), 0);
        assert_eq!(queue.pending().len(), 1);
        assert_eq!(store.redemption_count("t1", "evt_1"), 0);

        queue.set_offline(false);
        assert_eq!(worker(&queue, &store).tick().await.unwrap(), 1);
        assert_eq!(store.redemption_count("t1", "evt_1"), 1);
    }
}

//! Durable store: tickets, redemptions and the audit trail.
//!
//! The UNIQUE(ticket_id, event_id) constraint on redemptions is the sole
//! authority for exactly-one redemption; callers rely on the second insert
//! being rejected. ACCEPTED audit rows are written inside the redemption
//! transaction so a crashed commit leaves no ACCEPTED trace; every other
//! terminal decision is audited outside it.

use crate::config::DatabaseConfig;
use crate::dto::{DecisionStatus, ReasonCode};
use crate::error::{GateError, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

/// Provisioned ticket, read-only to the gate
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Ticket {
    pub id: String,
    pub event_id: String,
    pub org_id: String,
}

/// One terminal decision headed for the audit trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub decision_id: String,
    pub ip: String,
    pub user_agent: String,
    pub event_id: String,
    pub ticket_id: Option<String>,
    pub status: DecisionStatus,
    pub reason: ReasonCode,
}

/// Outcome of a redemption commit. Store failures other than the uniqueness
/// rejection surface as errors; callers degrade those to the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Redemption row and ACCEPTED audit row are durable
    Committed,
    /// UNIQUE(ticket_id, event_id) rejected the insert; nothing was written
    Duplicate,
}

/// Durable operations the pipeline and the reconciler depend on. Trait seam
/// so tests can substitute a scratch in-memory store.
#[async_trait]
pub trait RedemptionStore: Send + Sync {
    async fn fetch_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>>;

    /// Within one transaction, insert the redemption row and its ACCEPTED
    /// audit row (`reason` is OK online, OK_SYNCED from the drain).
    async fn commit_redemption(
        &self,
        ticket_id: &str,
        event_id: &str,
        decision_id: &str,
        ip: &str,
        user_agent: &str,
        reason: ReasonCode,
    ) -> Result<CommitOutcome>;

    /// Append one audit row outside any redemption transaction.
    async fn record_decision(&self, record: &AuditRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: PgPool,
}

const INSERT_AUDIT: &str = r#"
    INSERT INTO audit_logs (decision_id, ip, user_agent, event_id, ticket_id, status, reason_code)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<bool> {
        let result = sqlx::query("SELECT 1").fetch_one(&self.pool).await;
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                error!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[async_trait]
impl RedemptionStore for DatabaseManager {
    async fn fetch_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>> {
        let ticket = sqlx::query_as::<_, Ticket>(
            "SELECT id, event_id, org_id FROM tickets WHERE id = $1",
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ticket)
    }

    async fn commit_redemption(
        &self,
        ticket_id: &str,
        event_id: &str,
        decision_id: &str,
        ip: &str,
        user_agent: &str,
        reason: ReasonCode,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query("INSERT INTO redemptions (ticket_id, event_id) VALUES ($1, $2)")
            .bind(ticket_id)
            .bind(event_id)
            .execute(&mut *tx)
            .await;

        if let Err(err) = inserted {
            tx.rollback().await.ok();
            if is_unique_violation(&err) {
                return Ok(CommitOutcome::Duplicate);
            }
            return Err(GateError::Database(err));
        }

        // Dropped tx rolls back if the audit insert or the commit fails, so a
        // redemption is never durable without its ACCEPTED audit row.
        sqlx::query(INSERT_AUDIT)
            .bind(decision_id)
            .bind(ip)
            .bind(user_agent)
            .bind(event_id)
            .bind(Some(ticket_id))
            .bind(DecisionStatus::Accepted.as_str())
            .bind(reason.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn record_decision(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(INSERT_AUDIT)
            .bind(&record.decision_id)
            .bind(&record.ip)
            .bind(&record.user_agent)
            .bind(&record.event_id)
            .bind(&record.ticket_id)
            .bind(record.status.as_str())
            .bind(record.reason.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

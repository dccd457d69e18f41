//! The per-request decision engine.
//!
//! Gate order is significant: the idempotency lookup precedes everything so a
//! retried request never double-counts against the rate limiter or the
//! replay guard; rate admission precedes token verify so signature guessing
//! is throttled; the replay guard precedes the durable write so a flood of
//! genuine-looking replays never touches the durable store.

use crate::config::GateConfig;
use crate::database::{AuditRecord, CommitOutcome, RedemptionStore};
use crate::dto::{DecisionStatus, ReasonCode, ValidateResponse};
use crate::error::Result;
use crate::idempotency::IdempotencyCache;
use crate::offline::{OfflineFlag, OfflineQueue, QueuedValidation};
use crate::rate_limit::RateLimiter;
use crate::replay::ReplayGuard;
use crate::token::{TokenError, TokenVerifier};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One validation request as seen by the pipeline: the client body plus the
/// ambient origin attributes the handler extracted.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub qr_token: String,
    pub event_id: String,
    pub idempotency_key: Option<String>,
    pub ip: String,
    pub user_agent: String,
}

/// Pipeline output. `Memoized` carries the reply bytes exactly as originally
/// sent; the handler must return them verbatim, not re-encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineReply {
    Memoized(String),
    Fresh(ValidateResponse),
}

/// Tunables threaded from configuration
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub rate_capacity: u32,
    pub rate_refill_per_sec: f64,
    pub idempotency_ttl_secs: u64,
}

impl From<&GateConfig> for GateSettings {
    fn from(config: &GateConfig) -> Self {
        Self {
            rate_capacity: config.rate_capacity,
            rate_refill_per_sec: config.rate_refill_per_sec,
            idempotency_ttl_secs: config.idempotency_ttl_secs,
        }
    }
}

/// Orchestrates the gate sequence per request. Holds no durable state
/// between requests; all cross-request state lives in the injected stores.
pub struct DecisionPipeline {
    verifier: TokenVerifier,
    rate_limiter: Arc<dyn RateLimiter>,
    idempotency: Arc<dyn IdempotencyCache>,
    replay: Arc<dyn ReplayGuard>,
    queue: Arc<dyn OfflineQueue>,
    flag: Arc<dyn OfflineFlag>,
    store: Arc<dyn RedemptionStore>,
    settings: GateSettings,
}

impl DecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: TokenVerifier,
        rate_limiter: Arc<dyn RateLimiter>,
        idempotency: Arc<dyn IdempotencyCache>,
        replay: Arc<dyn ReplayGuard>,
        queue: Arc<dyn OfflineQueue>,
        flag: Arc<dyn OfflineFlag>,
        store: Arc<dyn RedemptionStore>,
        settings: GateSettings,
    ) -> Self {
        Self {
            verifier,
            rate_limiter,
            idempotency,
            replay,
            queue,
            flag,
            store,
            settings,
        }
    }

    /// Run the ordered gate sequence; the first matching outcome terminates.
    /// Every terminal outcome writes one audit record (ACCEPTED is written
    /// inside the redemption transaction) and, when an idempotency key is
    /// present, memos the reply. Errors abort the request without audit or
    /// memo; the client retry with a stable key converges.
    pub async fn validate(&self, request: ValidationRequest) -> Result<PipelineReply> {
        let decision_id = Uuid::new_v4().to_string();

        // A memoed reply is returned verbatim, with no side effects
        if let Some(key) = &request.idempotency_key {
            if let Some(reply) = self.idempotency.lookup(key).await? {
                debug!(idempotency_key = %key, "replaying memoed reply");
                return Ok(PipelineReply::Memoized(reply));
            }
        }

        let admitted = self
            .rate_limiter
            .admit(
                &request.ip,
                self.settings.rate_capacity,
                self.settings.rate_refill_per_sec,
            )
            .await?;
        if !admitted {
            debug!(ip = %request.ip, "origin bucket drained");
            return self.reject(&request, decision_id, None, ReasonCode::RateLimited).await;
        }

        let claims = match self.verifier.verify(&request.qr_token) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => {
                return self.reject(&request, decision_id, None, ReasonCode::Expired).await;
            }
            Err(TokenError::InvalidToken) => {
                return self
                    .reject(&request, decision_id, None, ReasonCode::InvalidToken)
                    .await;
            }
        };

        if claims.event_id != request.event_id {
            return self
                .reject(&request, decision_id, Some(claims.ticket_id), ReasonCode::WrongEvent)
                .await;
        }

        if !self.replay.claim(&request.event_id, &claims.nonce).await? {
            return self
                .reject(&request, decision_id, Some(claims.ticket_id), ReasonCode::Replay)
                .await;
        }

        if self.flag.is_offline().await? {
            return self.defer(&request, decision_id, claims.ticket_id).await;
        }

        match self.store.fetch_ticket(&claims.ticket_id).await {
            // The credential verified but refers to no provisioned ticket
            Ok(None) => {
                self.reject(&request, decision_id, Some(claims.ticket_id), ReasonCode::InvalidToken)
                    .await
            }
            Ok(Some(ticket)) => {
                let committed = self
                    .store
                    .commit_redemption(
                        &ticket.id,
                        &request.event_id,
                        &decision_id,
                        &request.ip,
                        &request.user_agent,
                        ReasonCode::Ok,
                    )
                    .await;

                match committed {
                    Ok(CommitOutcome::Committed) => {
                        // The commit wrote the ACCEPTED audit row already
                        let response = ValidateResponse {
                            status: DecisionStatus::Accepted,
                            reason_code: ReasonCode::Ok,
                            ticket_id: Some(ticket.id),
                            decision_id,
                        };
                        self.finish(&request, response, false).await
                    }
                    Ok(CommitOutcome::Duplicate) => {
                        self.reject(&request, decision_id, Some(ticket.id), ReasonCode::Replay)
                            .await
                    }
                    Err(err) => {
                        warn!(error = %err, "redemption commit failed, deferring decision");
                        self.defer(&request, decision_id, ticket.id).await
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "ticket lookup failed, deferring decision");
                self.defer(&request, decision_id, claims.ticket_id).await
            }
        }
    }

    async fn reject(
        &self,
        request: &ValidationRequest,
        decision_id: String,
        ticket_id: Option<String>,
        reason: ReasonCode,
    ) -> Result<PipelineReply> {
        let response = ValidateResponse {
            status: DecisionStatus::Rejected,
            reason_code: reason,
            ticket_id,
            decision_id,
        };
        self.finish(request, response, true).await
    }

    /// Durable path unavailable or operator offline: append to the queue and
    /// reply PENDING_SYNC; the reconciler settles it later.
    async fn defer(
        &self,
        request: &ValidationRequest,
        decision_id: String,
        ticket_id: String,
    ) -> Result<PipelineReply> {
        self.queue
            .enqueue(&QueuedValidation {
                decision_id: decision_id.clone(),
                event_id: request.event_id.clone(),
                ticket_id: ticket_id.clone(),
                ip: request.ip.clone(),
                ua: request.user_agent.clone(),
            })
            .await?;

        let response = ValidateResponse {
            status: DecisionStatus::PendingSync,
            reason_code: ReasonCode::SystemOffline,
            ticket_id: Some(ticket_id),
            decision_id,
        };
        self.finish(request, response, true).await
    }

    async fn finish(
        &self,
        request: &ValidationRequest,
        response: ValidateResponse,
        audit: bool,
    ) -> Result<PipelineReply> {
        if audit {
            let record = AuditRecord {
                decision_id: response.decision_id.clone(),
                ip: request.ip.clone(),
                user_agent: request.user_agent.clone(),
                event_id: request.event_id.clone(),
                ticket_id: response.ticket_id.clone(),
                status: response.status,
                reason: response.reason_code,
            };
            // Best-effort outside the redemption transaction; the reply
            // stands even if the row cannot be written.
            if let Err(err) = self.store.record_decision(&record).await {
                warn!(error = %err, decision_id = %record.decision_id, "audit write failed");
            }
        }

        if let Some(key) = &request.idempotency_key {
            let body = serde_json::to_string(&response)?;
            self.idempotency
                .memo(key, &body, self.settings.idempotency_ttl_secs)
                .await?;
        }

        Ok(PipelineReply::Fresh(response))
    }
}

//! HTTP handlers for the validation gate
//! The decision surface is a single POST endpoint; outcomes always travel in
//! a 200 body and only undecidable requests produce an error status.

use crate::database::DatabaseManager;
use crate::dto::{HealthResponse, ValidateRequest};
use crate::error::ApiError;
use crate::pipeline::{DecisionPipeline, PipelineReply, ValidationRequest};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use redis::aio::ConnectionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DecisionPipeline>,
    pub database: Arc<DatabaseManager>,
    pub cache: ConnectionManager,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/validate", post(validate_ticket))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Decide one presented credential. The peer address is the rate-limit
/// origin; `Idempotency-Key` and `User-Agent` ride along into the pipeline.
async fn validate_ticket(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ValidateRequest>,
) -> Result<Response, ApiError> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let request = ValidationRequest {
        qr_token: body.qr_token,
        event_id: body.event_id,
        idempotency_key,
        ip: addr.ip().to_string(),
        user_agent,
    };

    match state.pipeline.validate(request).await {
        Ok(PipelineReply::Fresh(response)) => Ok(Json(response).into_response()),
        // Memoed replies go out byte-for-byte as originally sent
        Ok(PipelineReply::Memoized(body)) => {
            Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
        }
        Err(err) => {
            error!("Validation pipeline failed: {}", err);
            Err(ApiError::from(err))
        }
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = state.database.health_check().await.unwrap_or(false);

    let mut conn = state.cache.clone();
    let cache = redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .is_ok();

    let status = if database && cache { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        database,
        cache,
    })
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GateError>;

/// Internal error type for the gate service
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed queue entry: {0}")]
    MalformedQueueEntry(String),
}

/// API Error types for consistent error handling at the HTTP edge.
/// Gate outcomes (REJECTED, PENDING_SYNC, ...) are not errors; they travel in
/// the 200 reply body. This type only covers requests the service could not
/// decide at all.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Convert internal errors to API errors. Store connectivity problems map to
/// 503 so load balancers can react; everything else is a 500. The reply never
/// carries the underlying error detail.
impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Database(_) | GateError::Cache(_) => {
                ApiError::ServiceUnavailable("Backing store unavailable".to_string())
            }
            _ => ApiError::InternalServerError("Internal error".to_string()),
        }
    }
}

//! Wire-level request and response types for the validation surface.
//! Status and reason strings are stable; external log consumers depend on
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Body of `POST /validate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub qr_token: String,
    pub event_id: String,
}

/// Reply for `POST /validate`. Always delivered with HTTP 200; the `status`
/// field carries the outcome. `decision_id` is present on every reply,
/// `ticket_id` only once the credential yielded one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub status: DecisionStatus,
    pub reason_code: ReasonCode,
    pub ticket_id: Option<String>,
    pub decision_id: String,
}

/// Terminal status of one validation decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Accepted,
    Rejected,
    PendingSync,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Accepted => "ACCEPTED",
            DecisionStatus::Rejected => "REJECTED",
            DecisionStatus::PendingSync => "PENDING_SYNC",
        }
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code attached to every decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Ok,
    OkSynced,
    RateLimited,
    InvalidToken,
    Expired,
    WrongEvent,
    Replay,
    ReplayOnSync,
    SystemOffline,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Ok => "OK",
            ReasonCode::OkSynced => "OK_SYNCED",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::InvalidToken => "INVALID_TOKEN",
            ReasonCode::Expired => "EXPIRED",
            ReasonCode::WrongEvent => "WRONG_EVENT",
            ReasonCode::Replay => "REPLAY",
            ReasonCode::ReplayOnSync => "REPLAY_ON_SYNC",
            ReasonCode::SystemOffline => "SYSTEM_OFFLINE",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply for `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_serialize_to_stable_strings() {
        let codes = [
            (ReasonCode::Ok, "OK"),
            (ReasonCode::OkSynced, "OK_SYNCED"),
            (ReasonCode::RateLimited, "RATE_LIMITED"),
            (ReasonCode::InvalidToken, "INVALID_TOKEN"),
            (ReasonCode::Expired, "EXPIRED"),
            (ReasonCode::WrongEvent, "WRONG_EVENT"),
            (ReasonCode::Replay, "REPLAY"),
            (ReasonCode::ReplayOnSync, "REPLAY_ON_SYNC"),
            (ReasonCode::SystemOffline, "SYSTEM_OFFLINE"),
        ];
        for (code, expected) in codes {
            assert_eq!(serde_json::to_string(&code).unwrap(), format!("\"{}\"", expected));
            assert_eq!(code.as_str(), expected);
        }
    }

    #[test]
    fn statuses_serialize_to_stable_strings() {
        assert_eq!(serde_json::to_string(&DecisionStatus::Accepted).unwrap(), "\"ACCEPTED\"");
        assert_eq!(serde_json::to_string(&DecisionStatus::Rejected).unwrap(), "\"REJECTED\"");
        assert_eq!(serde_json::to_string(&DecisionStatus::PendingSync).unwrap(), "\"PENDING_SYNC\"");
    }

    #[test]
    fn response_field_order_is_deterministic() {
        let resp = ValidateResponse {
            status: DecisionStatus::Rejected,
            reason_code: ReasonCode::RateLimited,
            ticket_id: None,
            decision_id: "d-1".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"status":"REJECTED","reason_code":"RATE_LIMITED","ticket_id":null,"decision_id":"d-1"}"#
        );
    }
}

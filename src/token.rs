//! Credential verification for presented QR tokens
//! Tokens are compact HS256-signed claim envelopes minted by the external
//! provisioning tools; this module only verifies them.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by a valid ticket credential. All five fields are
/// required; a token missing any of them fails verification during parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    /// Ticket the credential redeems
    pub ticket_id: String,

    /// Event the credential is bound to
    pub event_id: String,

    /// Owning organization
    pub org_id: String,

    /// Per-token random value, presented once across the event window
    pub nonce: String,

    /// Expiry as integer epoch seconds
    pub exp: i64,
}

/// Verification outcome for a rejected credential. The pipeline dispatches
/// on the variant; no token error carries underlying detail to clients.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    Expired,
}

/// Verifier over the process-wide signing secret
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry comparison is strict wall-time, no leeway
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Parse and cryptographically verify a presented credential.
    ///
    /// Malformed envelope, wrong algorithm tag, signature mismatch or any
    /// absent claim resolves to `InvalidToken`; only `now > exp` on an
    /// otherwise valid token resolves to `Expired`.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        match decode::<TokenClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => Err(TokenError::Expired),
                _ => Err(TokenError::InvalidToken),
            },
        }
    }
}

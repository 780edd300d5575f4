// Signed access tokens handed out on approval

use crate::clock::Clock;
use crate::data_structures::{AccessMethod, UserId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user: UserId,
    pub method: AccessMethod,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature invalid")]
    BadSignature,
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("claims encoding failed: {0}")]
    Encoding(String),
}

/// Token format: `hex(claims_json).hex(signature)`.
pub struct TokenIssuer {
    signing_key: SigningKey,
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(signing_key: SigningKey, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1));
        TokenIssuer { signing_key, ttl, clock }
    }

    /// Issuer with a fresh random key; tokens do not survive a restart.
    pub fn generate(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let mut csprng = OsRng;
        TokenIssuer::new(SigningKey::generate(&mut csprng), ttl, clock)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn issue(&self, user: &UserId, method: AccessMethod) -> Result<String, TokenError> {
        let issued_at = self.clock.now();
        let claims = AccessClaims { user: user.clone(), method, issued_at, expires_at: issued_at + self.ttl };
        let body = serde_json::to_vec(&claims).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let signature = self.signing_key.sign(&body);
        Ok(format!("{}.{}", hex::encode(&body), hex::encode(signature.to_bytes())))
    }

    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let (body_hex, sig_hex) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let body = hex::decode(body_hex).map_err(|_| TokenError::Malformed)?;
        let sig_bytes: [u8; 64] = hex::decode(sig_hex)
            .map_err(|_| TokenError::Malformed)?
            .try_into()
            .map_err(|_| TokenError::Malformed)?;
        let signature = Signature::from_bytes(&sig_bytes);
        self.verifying_key().verify(&body, &signature).map_err(|_| TokenError::BadSignature)?;

        let claims: AccessClaims = serde_json::from_slice(&body).map_err(|_| TokenError::Malformed)?;
        if self.clock.now() >= claims.expires_at {
            return Err(TokenError::Expired(claims.expires_at));
        }
        Ok(claims)
    }
}

use crate::data_structures::canonical_phone;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Externally hosted code delivery / check service.
#[async_trait]
pub trait OtpProvider: Send + Sync {
    async fn issue(&self, phone: &str) -> Result<(), ProviderError>;
    async fn confirm(&self, phone: &str, code: &str) -> Result<ProviderVerdict, ProviderError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderVerdict {
    Approved,
    Denied,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProviderError {
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("provider unreachable: {0}")]
    Unreachable(String),
}

/// Outstanding code for one phone number. Single use.
#[derive(Clone, Debug, PartialEq)]
pub struct OtpRecord {
    pub phone: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts_remaining: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Approved,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum OtpError {
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("no code outstanding for this phone number")]
    NotIssued,
    #[error("code expired")]
    Expired,
    #[error("verification attempts exhausted")]
    Exhausted,
    #[error("code mismatch ({remaining} attempts left)")]
    Mismatch { remaining: u32 },
    #[error("OTP provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl OtpError {
    /// Provider outages may be retried by the caller; everything else is final
    /// for the current code.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OtpError::ProviderUnavailable(_))
    }
}

/// Canonical (E.164 digits) form used as the record key and for directory
/// lookups.
pub fn normalize_phone(raw: &str) -> Result<String, OtpError> {
    canonical_phone(raw).ok_or(OtpError::InvalidPhone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("+1 (555) 010-0001").unwrap(), "15550100001");
        assert_eq!(normalize_phone("5550100001").unwrap(), "15550100001");
        assert_eq!(normalize_phone("555-0100"), Err(OtpError::InvalidPhone));
        assert_eq!(normalize_phone("1234567890123456"), Err(OtpError::InvalidPhone));
        assert_eq!(normalize_phone(""), Err(OtpError::InvalidPhone));
    }

    #[test]
    fn only_provider_outage_is_retryable() {
        assert!(OtpError::ProviderUnavailable("timeout".into()).is_retryable());
        assert!(!OtpError::Expired.is_retryable());
        assert!(!OtpError::Mismatch { remaining: 2 }.is_retryable());
    }
}

// Issues and verifies one-time codes through an external provider, tracking
// expiry and remaining attempts per phone number.

use crate::clock::Clock;
use crate::config::OtpConfig;
use crate::otp::types::{
    normalize_phone, OtpError, OtpProvider, OtpRecord, ProviderError, ProviderVerdict, VerifyOutcome,
};
use chrono::Duration as ChronoDuration;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

// Each phone's record has its own lock so a slow provider round trip for one
// number never holds up another.
type RecordCell = Arc<Mutex<OtpRecord>>;

pub struct OtpCoordinator {
    provider: Arc<dyn OtpProvider>,
    clock: Arc<dyn Clock>,
    config: OtpConfig,
    records: Mutex<HashMap<String, RecordCell>>,
}

impl OtpCoordinator {
    pub fn new(provider: Arc<dyn OtpProvider>, clock: Arc<dyn Clock>, config: OtpConfig) -> Self {
        OtpCoordinator { provider, clock, config, records: Mutex::new(HashMap::new()) }
    }

    async fn call_provider<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, OtpError> {
        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(OtpError::ProviderUnavailable(e.to_string())),
            Err(_) => Err(OtpError::ProviderUnavailable(format!(
                "no response within {:?}",
                self.config.provider_timeout
            ))),
        }
    }

    /// Asks the provider to send a fresh code and (re)arms the local record.
    /// A failed send leaves no record behind.
    pub async fn issue(&self, phone: &str) -> Result<OtpRecord, OtpError> {
        let phone = normalize_phone(phone)?;
        if let Err(e) = self.call_provider(self.provider.issue(&phone)).await {
            warn!("[OTP] Issue failed for {}: {}", mask(&phone), e);
            self.records.lock().await.remove(&phone);
            return Err(e);
        }

        let issued_at = self.clock.now();
        let ttl = ChronoDuration::from_std(self.config.ttl).unwrap_or_else(|_| ChronoDuration::minutes(5));
        let record = OtpRecord {
            phone: phone.clone(),
            issued_at,
            expires_at: issued_at + ttl,
            attempts_remaining: self.config.max_attempts,
        };
        // A fresh cell; a verify still holding the old one will find it
        // detached and report NotIssued.
        self.records.lock().await.insert(phone.clone(), Arc::new(Mutex::new(record.clone())));
        info!("[OTP] Code issued to {} (expires {})", mask(&phone), record.expires_at);
        Ok(record)
    }

    /// Checks a submitted code. On approval the record is consumed; every
    /// other outcome is reported as an `OtpError`.
    pub async fn verify(&self, phone: &str, code: &str) -> Result<VerifyOutcome, OtpError> {
        let phone = normalize_phone(phone)?;
        let cell = self.records.lock().await.get(&phone).cloned().ok_or(OtpError::NotIssued)?;

        // Held across the provider call so concurrent submissions for one
        // phone cannot both spend the same attempt. The map lock is not.
        let mut record = cell.lock().await;
        if !self.is_current(&phone, &cell).await {
            // Consumed or re-issued while we waited for the record.
            return Err(OtpError::NotIssued);
        }

        if self.clock.now() > record.expires_at {
            debug!("[OTP] Code for {} expired at {}", mask(&phone), record.expires_at);
            return Err(OtpError::Expired);
        }
        if record.attempts_remaining == 0 {
            return Err(OtpError::Exhausted);
        }

        let verdict = if is_well_formed(code) {
            self.call_provider(self.provider.confirm(&phone, code)).await?
        } else {
            debug!("[OTP] Malformed code submitted for {}", mask(&phone));
            ProviderVerdict::Denied
        };

        match verdict {
            ProviderVerdict::Approved => {
                // Removed while the record lock is still held, so a queued
                // submission for the same code sees NotIssued.
                let mut records = self.records.lock().await;
                if records.get(&phone).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                    records.remove(&phone);
                }
                info!("[OTP] Code approved for {}", mask(&phone));
                Ok(VerifyOutcome::Approved)
            }
            ProviderVerdict::Denied => {
                record.attempts_remaining -= 1;
                let remaining = record.attempts_remaining;
                warn!("[OTP] Code mismatch for {} ({} attempts left)", mask(&phone), remaining);
                if remaining == 0 {
                    Err(OtpError::Exhausted)
                } else {
                    Err(OtpError::Mismatch { remaining })
                }
            }
        }
    }

    async fn is_current(&self, phone: &str, cell: &RecordCell) -> bool {
        self.records.lock().await.get(phone).is_some_and(|current| Arc::ptr_eq(current, cell))
    }

    /// Drops records whose expiry has passed. Returns how many were removed.
    /// Records with a verification in flight are left for the next sweep.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, cell| match cell.try_lock() {
            Ok(record) => record.expires_at >= now,
            Err(_) => true,
        });
        before - records.len()
    }

    pub async fn outstanding(&self, phone: &str) -> Option<OtpRecord> {
        let phone = normalize_phone(phone).ok()?;
        let cell = self.records.lock().await.get(&phone).cloned()?;
        let record = cell.lock().await.clone();
        Some(record)
    }
}

fn is_well_formed(code: &str) -> bool {
    (4..=10).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit())
}

fn mask(phone: &str) -> String {
    let tail = &phone[phone.len().saturating_sub(4)..];
    format!("***{}", tail)
}

use crate::clock::Clock;
use crate::data_structures::{AccessMethod, UserId};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    /// Journaled before the unlock command goes out.
    Pending,
    Granted,
    DispatchTimeout,
    ActuatorRejected,
    DispatchFailed,
    Denied,
    SpoofSuspected,
    OtpRequired,
    OtpMismatch,
    OtpExpired,
    OtpExhausted,
    ProviderUnavailable,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Matches the serialized form.
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// Attempt to be journaled. The log assigns id, timestamp and digest.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessAttempt {
    pub user: Option<UserId>,
    pub user_name: Option<String>,
    pub method: AccessMethod,
    pub status: AuditStatus,
    pub request_id: Option<String>,
    /// Earlier entry this one resolves (e.g. the `PENDING` row of a dispatch).
    pub resolves: Option<u64>,
}

impl AccessAttempt {
    pub fn new(user: Option<UserId>, user_name: Option<String>, method: AccessMethod, status: AuditStatus) -> Self {
        AccessAttempt { user, user_name, method, status, request_id: None, resolves: None }
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Resolution of `entry`, carrying over its user, method and request id.
    pub fn resolution_of(entry: &AuditEntry, status: AuditStatus) -> Self {
        AccessAttempt {
            user: entry.user.clone(),
            user_name: entry.user_name.clone(),
            method: entry.method,
            status,
            request_id: entry.request_id.clone(),
            resolves: Some(entry.id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub user: Option<UserId>,
    pub user_name: Option<String>,
    pub method: AccessMethod,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub resolves: Option<u64>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    fn digest(
        prev_hash: &str,
        id: u64,
        attempt: &AccessAttempt,
        timestamp: &DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(id.to_be_bytes());
        hasher.update(attempt.user.as_ref().map(|u| u.as_str()).unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(attempt.user_name.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(attempt.method.to_string().as_bytes());
        hasher.update(attempt.status.to_string().as_bytes());
        hasher.update(timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
        hasher.update(attempt.request_id.as_deref().unwrap_or("").as_bytes());
        hasher.update(attempt.resolves.unwrap_or(0).to_be_bytes());
        hex::encode(hasher.finalize())
    }

    fn as_attempt(&self) -> AccessAttempt {
        AccessAttempt {
            user: self.user.clone(),
            user_name: self.user_name.clone(),
            method: self.method,
            status: self.status,
            request_id: self.request_id.clone(),
            resolves: self.resolves,
        }
    }
}

/// Reporting row: one per access attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecordView {
    pub user: Option<UserId>,
    pub user_name: Option<String>,
    pub method: AccessMethod,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum AuditError {
    #[error("audit chain broken at entry {id}")]
    ChainBroken { id: u64 },
}

/// Journal of access attempts. `append` is the only mutation.
pub struct AuditLog {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        AuditLog { clock, entries: Mutex::new(Vec::new()) }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, attempt: AccessAttempt) -> AuditEntry {
        let mut entries = self.guard();
        let id = entries.len() as u64 + 1;
        let prev_hash = entries.last().map(|e| e.hash.clone()).unwrap_or_else(|| GENESIS_HASH.to_string());
        let timestamp = self.clock.now();
        let hash = AuditEntry::digest(&prev_hash, id, &attempt, &timestamp);
        let entry = AuditEntry {
            id,
            user: attempt.user,
            user_name: attempt.user_name,
            method: attempt.method,
            status: attempt.status,
            timestamp,
            request_id: attempt.request_id,
            resolves: attempt.resolves,
            prev_hash,
            hash,
        };
        debug!(
            "[AuditLog] #{} {} {} {}",
            entry.id,
            entry.user.as_ref().map(|u| u.as_str()).unwrap_or("-"),
            entry.method,
            entry.status
        );
        entries.push(entry.clone());
        entry
    }

    /// Raw entries, newest first (ties broken by insertion order).
    pub fn entries(&self) -> Vec<AuditEntry> {
        let mut out = self.guard().clone();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        out
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One row per attempt, with the status of its latest resolution,
    /// newest attempt first.
    pub fn resolved(&self) -> Vec<AuditRecordView> {
        let entries = self.guard().clone();
        let mut latest: HashMap<u64, AuditStatus> = HashMap::new();
        for e in &entries {
            if let Some(root) = e.resolves {
                latest.insert(root, e.status);
            }
        }
        let mut rows: Vec<(u64, AuditRecordView)> = entries
            .into_iter()
            .filter(|e| e.resolves.is_none())
            .map(|e| {
                let status = latest.get(&e.id).copied().unwrap_or(e.status);
                (
                    e.id,
                    AuditRecordView { user: e.user, user_name: e.user_name, method: e.method, status, timestamp: e.timestamp },
                )
            })
            .collect();
        rows.sort_by(|(a_id, a), (b_id, b)| b.timestamp.cmp(&a.timestamp).then(b_id.cmp(a_id)));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Recomputes every digest in insertion order.
    pub fn verify_chain(&self) -> Result<(), AuditError> {
        let entries = self.guard();
        let mut prev = GENESIS_HASH.to_string();
        for e in entries.iter() {
            let expected = AuditEntry::digest(&prev, e.id, &e.as_attempt(), &e.timestamp);
            if e.prev_hash != prev || e.hash != expected {
                error!("[AuditLog] Chain verification failed at entry {}", e.id);
                return Err(AuditError::ChainBroken { id: e.id });
            }
            prev = e.hash.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn attempt(user: &str, status: AuditStatus) -> AccessAttempt {
        AccessAttempt::new(Some(UserId::new(user)), None, AccessMethod::Face, status)
    }

    #[test]
    fn reads_are_newest_first() {
        let clock = Arc::new(ManualClock::default());
        let log = AuditLog::new(clock.clone());
        log.append(attempt("alice", AuditStatus::Denied));
        clock.advance(ChronoDuration::seconds(5));
        log.append(attempt("bob", AuditStatus::Denied));
        log.append(attempt("carol", AuditStatus::Denied));

        let users: Vec<String> = log.entries().iter().map(|e| e.user.as_ref().unwrap().to_string()).collect();
        assert_eq!(users, vec!["carol", "bob", "alice"]);
    }

    #[test]
    fn resolution_is_a_new_entry() {
        let log = AuditLog::new(Arc::new(ManualClock::default()));
        let pending = log.append(attempt("alice", AuditStatus::Pending).with_request("ab12"));
        log.append(AccessAttempt::resolution_of(&pending, AuditStatus::Granted));

        let raw = log.entries();
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().any(|e| e.status == AuditStatus::Pending));
        assert_eq!(raw[0].resolves, Some(pending.id));
        assert_eq!(raw[0].request_id.as_deref(), Some("ab12"));

        let rows = log.resolved();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AuditStatus::Granted);
    }

    #[test]
    fn tampering_breaks_chain() {
        let log = AuditLog::new(Arc::new(ManualClock::default()));
        log.append(attempt("alice", AuditStatus::Denied));
        log.append(attempt("bob", AuditStatus::Pending));
        log.append(attempt("carol", AuditStatus::Denied));
        assert_eq!(log.verify_chain(), Ok(()));

        log.guard()[1].status = AuditStatus::Granted;
        assert_eq!(log.verify_chain(), Err(AuditError::ChainBroken { id: 2 }));
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(AuditStatus::DispatchTimeout.to_string(), "DISPATCH_TIMEOUT");
        let row = AuditRecordView {
            user: Some(UserId::new("alice")),
            user_name: Some("Alice".into()),
            method: AccessMethod::Combined,
            status: AuditStatus::Granted,
            timestamp: ManualClock::default().now(),
        };
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["method"], "combined");
        assert_eq!(v["status"], "GRANTED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_chain_intact() {
        let log = Arc::new(AuditLog::new(Arc::new(ManualClock::default())));
        let mut handles = Vec::new();
        for w in 0..8 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    log.append(attempt(&format!("user{}", w), AuditStatus::Denied));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(log.len(), 200);
        assert_eq!(log.verify_chain(), Ok(()));
        let mut ids: Vec<u64> = log.entries().iter().map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }
}

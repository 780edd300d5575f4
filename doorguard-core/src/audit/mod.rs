// Append-only access audit log

pub mod journal;

pub use journal::{AccessAttempt, AuditEntry, AuditError, AuditLog, AuditRecordView, AuditStatus};

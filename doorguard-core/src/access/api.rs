// Request/response bodies of the external interface and the error mapping
// onto it.

use crate::directory::DirectoryError;
use crate::dispatch::DispatchError;
use crate::otp::OtpError;
use crate::session::{SessionError, SessionId, SessionOutcome, SessionSnapshot, SessionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartRecognitionResponse {
    pub started: bool,
    pub session_id: SessionId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStage {
    Capturing,
    Matching,
}

/// What happened after a session's terminal result was acted on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum AccessResult {
    Granted { token: String },
    OtpRequired { expires_at: DateTime<Utc> },
    Denied { reason: String },
    Unavailable { reason: String, retryable: bool },
    NoAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletedRecognition {
    #[serde(flatten)]
    pub outcome: SessionOutcome,
    #[serde(flatten)]
    pub access: AccessResult,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteTag {
    Complete,
}

/// Payload of `recognition-status`. The shape depends on the session state:
/// `{active: true, ...}` while running, `{status: "<outcome>", ...}` once
/// terminal, `{status: "complete", result: {...}}` after it was acted on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecognitionStatus {
    Running { active: bool, session_id: SessionId, stage: RecognitionStage, attempt: Option<usize> },
    Complete { status: CompleteTag, session_id: SessionId, result: CompletedRecognition },
    Terminal(SessionOutcome),
    Idle { active: bool },
}

impl RecognitionStatus {
    pub fn from_snapshot(snap: &SessionSnapshot, access: Option<AccessResult>) -> Self {
        let Some(session_id) = snap.session else {
            return RecognitionStatus::Idle { active: false };
        };
        match &snap.state {
            SessionState::Idle => RecognitionStatus::Idle { active: false },
            SessionState::Capturing { attempt } => RecognitionStatus::Running {
                active: true,
                session_id,
                stage: RecognitionStage::Capturing,
                attempt: Some(*attempt),
            },
            SessionState::Matching => {
                RecognitionStatus::Running { active: true, session_id, stage: RecognitionStage::Matching, attempt: None }
            }
            SessionState::Finished(outcome) => RecognitionStatus::Terminal(outcome.clone()),
            SessionState::Complete(outcome) => RecognitionStatus::Complete {
                status: CompleteTag::Complete,
                session_id,
                result: CompletedRecognition {
                    outcome: outcome.clone(),
                    access: access.unwrap_or(AccessResult::NoAction),
                },
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerifyOtpRequest {
    pub phone: String,
    pub code: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpStatus {
    Approved,
    Denied,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerifyOtpResponse {
    pub status: OtpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
}

impl VerifyOtpResponse {
    pub fn approved(token: String) -> Self {
        VerifyOtpResponse { status: OtpStatus::Approved, token: Some(token), reason: None, attempts_remaining: None }
    }

    pub fn denied(reason: impl Into<String>, attempts_remaining: Option<u32>) -> Self {
        VerifyOtpResponse { status: OtpStatus::Denied, token: None, reason: Some(reason.into()), attempts_remaining }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryRequestResponse {
    pub otp_sent: bool,
    pub expires_at: DateTime<Utc>,
}

/// Error categories the outer interface maps to status codes.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("unavailable: {reason}")]
    Unavailable { reason: String, retryable: bool },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Unavailable { retryable: true, .. })
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::AlreadyActive => ApiError::Conflict(e.to_string()),
            SessionError::CameraResetPending | SessionError::CameraUnavailable(_) => {
                ApiError::Unavailable { reason: e.to_string(), retryable: true }
            }
            SessionError::Halted => ApiError::Fatal(e.to_string()),
            SessionError::NotFound(_) => ApiError::NotFound(e.to_string()),
            SessionError::NotTerminal(_) => ApiError::Conflict(e.to_string()),
        }
    }
}

impl From<OtpError> for ApiError {
    fn from(e: OtpError) -> Self {
        match e {
            OtpError::InvalidPhone => ApiError::InvalidRequest(e.to_string()),
            OtpError::NotIssued => ApiError::NotFound(e.to_string()),
            OtpError::ProviderUnavailable(_) => ApiError::Unavailable { reason: e.to_string(), retryable: true },
            OtpError::Expired | OtpError::Exhausted | OtpError::Mismatch { .. } => ApiError::Denied(e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let retryable = e.is_retryable();
        ApiError::Unavailable { reason: e.to_string(), retryable }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        ApiError::Unavailable { reason: e.to_string(), retryable: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::DistanceFeedback;
    use serde_json::json;

    fn snap(session: u64, state: SessionState) -> SessionSnapshot {
        SessionSnapshot { session: Some(SessionId(session)), state, ..SessionSnapshot::idle() }
    }

    #[test]
    fn status_payload_shapes() {
        let idle = RecognitionStatus::from_snapshot(&SessionSnapshot::idle(), None);
        assert_eq!(serde_json::to_value(&idle).unwrap(), json!({"active": false}));

        let running = RecognitionStatus::from_snapshot(&snap(3, SessionState::Capturing { attempt: 2 }), None);
        let v = serde_json::to_value(&running).unwrap();
        assert_eq!(v["active"], true);
        assert_eq!(v["stage"], "capturing");

        let small = RecognitionStatus::from_snapshot(
            &snap(3, SessionState::Finished(SessionOutcome::FaceTooSmall { feedback: DistanceFeedback::TooFar })),
            None,
        );
        assert_eq!(serde_json::to_value(&small).unwrap(), json!({"status": "face_too_small", "feedback": "too_far"}));

        let done = RecognitionStatus::from_snapshot(&snap(3, SessionState::Complete(SessionOutcome::Unmatched)), None);
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"status": "complete", "session_id": 3, "result": {"status": "unmatched", "access": "no_action"}})
        );
    }

    #[test]
    fn protocol_failures_are_retryable() {
        let e: ApiError = OtpError::ProviderUnavailable("down".into()).into();
        assert!(e.is_retryable());
        let e: ApiError = DispatchError::ActuatorUnresponsive { request_id: "x".into(), after: std::time::Duration::from_secs(3) }.into();
        assert!(e.is_retryable());
        let e: ApiError = SessionError::AlreadyActive.into();
        assert!(matches!(e, ApiError::Conflict(_)));
    }

    #[test]
    fn denied_response_omits_token() {
        let v = serde_json::to_value(VerifyOtpResponse::denied("code mismatch", Some(3))).unwrap();
        assert_eq!(v, json!({"status": "denied", "reason": "code mismatch", "attempts_remaining": 3}));
    }
}

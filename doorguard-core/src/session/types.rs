// Recognition session state model

use crate::liveness::{DistanceFeedback, MatchedUser};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Terminal result of one recognition session. Each variant carries only the
/// fields valid for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    FaceTooSmall { feedback: DistanceFeedback },
    NoFace,
    LivenessFailed,
    Matched { user: MatchedUser },
    Unmatched,
    RegistrationNeeded,
    TimedOut,
    Error { reason: String },
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::FaceTooSmall { .. } => "FACE_TOO_SMALL",
            SessionOutcome::NoFace => "NO_FACE",
            SessionOutcome::LivenessFailed => "LIVENESS_FAILED",
            SessionOutcome::Matched { .. } => "MATCHED",
            SessionOutcome::Unmatched => "UNMATCHED",
            SessionOutcome::RegistrationNeeded => "REGISTRATION_NEEDED",
            SessionOutcome::TimedOut => "TIMED_OUT",
            SessionOutcome::Error { .. } => "ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    Idle,
    Capturing { attempt: usize },
    Matching,
    /// Terminal, not yet consumed.
    Finished(SessionOutcome),
    /// Terminal result consumed by the caller.
    Complete(SessionOutcome),
}

impl SessionState {
    /// A worker is still driving this session.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Capturing { .. } | SessionState::Matching)
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        match self {
            SessionState::Finished(o) | SessionState::Complete(o) => Some(o),
            _ => None,
        }
    }
}

/// Immutable view handed to pollers.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub session: Option<SessionId>,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub deadline: Option<Instant>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        SessionSnapshot { session: None, state: SessionState::Idle, started_at: None, last_activity: None, deadline: None }
    }

    /// Running session whose deadline has already passed.
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.state.is_running() && self.deadline.map_or(false, |d| now >= d)
    }
}

/// Out-of-band notice that the camera needs a hardware reset before the next
/// session can start.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraResetSignal {
    pub session: SessionId,
    pub consecutive_faults: usize,
    pub last_fault: String,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("a recognition session is already active")]
    AlreadyActive,
    #[error("camera reset pending; new sessions are refused until it completes")]
    CameraResetPending,
    #[error("session starts halted after an internal invariant violation")]
    Halted,
    #[error("{0} not found")]
    NotFound(SessionId),
    #[error("{0} has not reached a terminal state")]
    NotTerminal(SessionId),
    #[error("camera reset failed: {0}")]
    CameraUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::UserId;
    use serde_json::json;

    #[test]
    fn outcome_payload_is_tagged() {
        let small = SessionOutcome::FaceTooSmall { feedback: DistanceFeedback::TooFar };
        assert_eq!(serde_json::to_value(&small).unwrap(), json!({"status": "face_too_small", "feedback": "too_far"}));

        let matched = SessionOutcome::Matched {
            user: MatchedUser { user_id: UserId::new("alice"), distance: 0.25, confidence: 0.75 },
        };
        let v = serde_json::to_value(&matched).unwrap();
        assert_eq!(v["status"], "matched");
        assert_eq!(v["user"]["user_id"], "alice");
        assert_eq!(serde_json::to_value(SessionOutcome::TimedOut).unwrap(), json!({"status": "timed_out"}));
    }

    #[test]
    fn running_states() {
        assert!(SessionState::Capturing { attempt: 1 }.is_running());
        assert!(SessionState::Matching.is_running());
        assert!(!SessionState::Idle.is_running());
        assert!(!SessionState::Finished(SessionOutcome::NoFace).is_running());
        assert_eq!(SessionState::Complete(SessionOutcome::Unmatched).outcome(), Some(&SessionOutcome::Unmatched));
    }
}

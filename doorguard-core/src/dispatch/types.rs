use crate::network::BusError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorCommand {
    UnlockDoor,
    LockDoor,
}

/// Outbound payload on `door/<device>/commands`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: DoorCommand,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// Inbound payload on `door/<device>/acks`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub ack: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnlockReceipt {
    pub request_id: String,
    pub audit_id: u64,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("actuator did not acknowledge {request_id} within {after:?}")]
    ActuatorUnresponsive { request_id: String, after: Duration },
    #[error("actuator rejected {request_id}")]
    ActuatorRejected { request_id: String },
    #[error("command bus: {0}")]
    Bus(#[from] BusError),
    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

impl DispatchError {
    /// Protocol failures the caller may retry. The door state is unknown or
    /// unchanged, never assumed open.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Encoding(_))
    }
}

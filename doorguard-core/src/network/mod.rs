// Pub/sub transport between the dispatcher and the door actuator

pub mod emulated;

pub use emulated::EmulatedBroker;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One delivered pub/sub message.
#[derive(Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum BusError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
}

/// Broker capability the core publishes commands and receives acks through.
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>, BusError>;
}

pub fn command_topic(device_id: &str) -> String {
    format!("door/{}/commands", device_id)
}

pub fn ack_topic(device_id: &str) -> String {
    format!("door/{}/acks", device_id)
}

/// Building-wide weekly schedule; every door subscribes to the same topic.
pub fn schedule_topic() -> String {
    "door/schedule".to_string()
}

pub(crate) fn check_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.split('/').any(|level| level.is_empty()) {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

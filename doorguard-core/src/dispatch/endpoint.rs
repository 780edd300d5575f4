// Device-side half of the command protocol: drives the door actuator and
// answers each command with an ack.

use crate::config::EndpointConfig;
use crate::dispatch::types::{AckMessage, CommandMessage, DoorCommand};
use crate::network::{ack_topic, command_topic, BusError, BusMessage, CommandBus};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Electrical door driver. Returns `true` once the command was executed.
#[async_trait]
pub trait DoorActuator: Send + Sync {
    async fn send_command(&self, command: DoorCommand) -> bool;
}

pub struct ActuatorEndpoint {
    bus: Arc<dyn CommandBus>,
    actuator: Arc<dyn DoorActuator>,
    config: EndpointConfig,
    ack_topic: String,
    relock: Option<JoinHandle<()>>,
}

impl ActuatorEndpoint {
    /// Subscribes to the device's command topic and serves it until the
    /// subscription closes.
    pub async fn spawn(
        bus: Arc<dyn CommandBus>,
        actuator: Arc<dyn DoorActuator>,
        config: EndpointConfig,
    ) -> Result<JoinHandle<()>, BusError> {
        let commands = bus.subscribe(&command_topic(&config.device_id)).await?;
        let endpoint = ActuatorEndpoint {
            ack_topic: ack_topic(&config.device_id),
            bus,
            actuator,
            config,
            relock: None,
        };
        info!("[ActuatorEndpoint] Serving door {}", endpoint.config.device_id);
        Ok(tokio::spawn(endpoint.run(commands)))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<BusMessage>) {
        while let Some(msg) = commands.recv().await {
            let cmd: CommandMessage = match serde_json::from_slice(&msg.payload) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!("[ActuatorEndpoint] Ignoring malformed command: {}", e);
                    continue;
                }
            };
            self.handle(cmd).await;
        }
        if let Some(relock) = self.relock.take() {
            relock.abort();
        }
        debug!("[ActuatorEndpoint] Command subscription closed");
    }

    async fn handle(&mut self, cmd: CommandMessage) {
        // Any new command supersedes a scheduled relock.
        if let Some(relock) = self.relock.take() {
            relock.abort();
        }

        let ack = match tokio::time::timeout(self.config.actuator_timeout, self.actuator.send_command(cmd.command)).await {
            Ok(done) => done,
            Err(_) => {
                warn!(
                    "[ActuatorEndpoint] Actuator did not complete {:?} within {:?}",
                    cmd.command, self.config.actuator_timeout
                );
                false
            }
        };
        debug!("[ActuatorEndpoint] {:?} ({}) -> ack={}", cmd.command, cmd.request_id, ack);

        let reply = AckMessage { request_id: cmd.request_id, ack };
        match serde_json::to_vec(&reply) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&self.ack_topic, payload).await {
                    warn!("[ActuatorEndpoint] Failed to publish ack {}: {}", reply.request_id, e);
                }
            }
            Err(e) => warn!("[ActuatorEndpoint] Failed to encode ack {}: {}", reply.request_id, e),
        }

        if ack && cmd.command == DoorCommand::UnlockDoor {
            self.relock = Some(self.schedule_relock());
        }
    }

    fn schedule_relock(&self) -> JoinHandle<()> {
        let actuator = Arc::clone(&self.actuator);
        let hold = self.config.relock_after;
        let timeout = self.config.actuator_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            match tokio::time::timeout(timeout, actuator.send_command(DoorCommand::LockDoor)).await {
                Ok(true) => info!("[ActuatorEndpoint] Door relocked after {:?}", hold),
                Ok(false) => warn!("[ActuatorEndpoint] Relock refused by actuator"),
                Err(_) => warn!("[ActuatorEndpoint] Relock timed out"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;
    use crate::network::EmulatedBroker;
    use crate::test_utils::{ActuatorBehavior, MockActuator};
    use std::time::Duration;

    async fn publish_command(bus: &EmulatedBroker, command: DoorCommand, id: &str) {
        let payload = serde_json::to_vec(&CommandMessage { command, request_id: id.into() }).unwrap();
        bus.publish("door/front-door/commands", payload).await.unwrap();
    }

    async fn next_ack(acks: &mut mpsc::Receiver<BusMessage>) -> AckMessage {
        let msg = tokio::time::timeout(Duration::from_secs(5), acks.recv()).await.unwrap().unwrap();
        serde_json::from_slice(&msg.payload).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_is_acked_then_relocked() {
        let config = AccessConfig::default();
        let broker = Arc::new(EmulatedBroker::new(config.bus()));
        let actuator = MockActuator::new(ActuatorBehavior::Ack);
        let mut acks = broker.subscribe("door/front-door/acks").await.unwrap();
        ActuatorEndpoint::spawn(broker.clone(), Arc::new(actuator.clone()), config.endpoint()).await.unwrap();

        publish_command(&broker, DoorCommand::UnlockDoor, "r1").await;
        assert_eq!(next_ack(&mut acks).await, AckMessage { request_id: "r1".into(), ack: true });
        assert_eq!(actuator.received(), vec![DoorCommand::UnlockDoor]);

        tokio::time::sleep(config.relock_after + Duration::from_secs(1)).await;
        assert_eq!(actuator.received(), vec![DoorCommand::UnlockDoor, DoorCommand::LockDoor]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_actuator_is_nacked() {
        let config = AccessConfig::default();
        let broker = Arc::new(EmulatedBroker::new(config.bus()));
        let actuator = MockActuator::new(ActuatorBehavior::Hang);
        let mut acks = broker.subscribe("door/front-door/acks").await.unwrap();
        ActuatorEndpoint::spawn(broker.clone(), Arc::new(actuator), config.endpoint()).await.unwrap();

        publish_command(&broker, DoorCommand::UnlockDoor, "r2").await;
        assert_eq!(next_ack(&mut acks).await, AckMessage { request_id: "r2".into(), ack: false });
    }
}

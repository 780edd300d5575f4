// Publishes door commands and waits for the actuator's ack. Every unlock is
// journaled as PENDING before anything goes on the wire.

use crate::audit::{AccessAttempt, AuditEntry, AuditLog, AuditStatus};
use crate::config::DispatchConfig;
use crate::data_structures::{AccessMethod, User};
use crate::dispatch::types::{AckMessage, CommandMessage, DispatchError, DoorCommand, UnlockReceipt};
use crate::network::{ack_topic, command_topic, BusMessage, CommandBus};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>;

pub struct DoorCommandDispatcher {
    bus: Arc<dyn CommandBus>,
    audit: Arc<AuditLog>,
    config: DispatchConfig,
    command_topic: String,
    pending: PendingAcks,
    ack_router: JoinHandle<()>,
}

enum AckWait {
    Acked(bool),
    TimedOut,
    RouterGone,
}

impl DoorCommandDispatcher {
    /// Subscribes to the device's ack topic and starts routing acks to
    /// waiting dispatches.
    pub async fn start(
        bus: Arc<dyn CommandBus>,
        audit: Arc<AuditLog>,
        config: DispatchConfig,
    ) -> Result<Self, DispatchError> {
        let acks = bus.subscribe(&ack_topic(&config.device_id)).await?;
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let ack_router = tokio::spawn(route_acks(acks, Arc::clone(&pending)));
        info!("[Dispatcher] Ready for device {}", config.device_id);
        Ok(DoorCommandDispatcher {
            command_topic: command_topic(&config.device_id),
            bus,
            audit,
            config,
            pending,
            ack_router,
        })
    }

    /// Unlocks the door for `user`. Only an ack from the actuator produces a
    /// GRANTED entry; no ack within the window resolves to DISPATCH_TIMEOUT.
    pub async fn unlock(&self, user: &User, method: AccessMethod) -> Result<UnlockReceipt, DispatchError> {
        let request_id = new_request_id();
        // PENDING goes in first: if we die between publish and ack the
        // attempt is still on record.
        let journaled = self.audit.append(
            AccessAttempt::new(Some(user.id.clone()), user.display_name.clone(), method, AuditStatus::Pending)
                .with_request(request_id.clone()),
        );
        info!("[Dispatcher] Unlock {} for {} via {} (audit #{})", request_id, user.id, method, journaled.id);

        let outcome = self.send_and_wait(DoorCommand::UnlockDoor, &request_id).await;
        // Every branch appends exactly one resolution for the PENDING entry.
        let receipt = UnlockReceipt { request_id: request_id.clone(), audit_id: journaled.id };
        match outcome {
            Ok(AckWait::Acked(true)) => {
                self.resolve(&journaled, AuditStatus::Granted);
                info!("[Dispatcher] Unlock {} acknowledged", request_id);
                Ok(receipt)
            }
            Ok(AckWait::Acked(false)) => {
                self.resolve(&journaled, AuditStatus::ActuatorRejected);
                warn!("[Dispatcher] Unlock {} rejected by actuator", request_id);
                Err(DispatchError::ActuatorRejected { request_id })
            }
            // No ack means we cannot know whether the door moved; never
            // report it as granted.
            Ok(AckWait::TimedOut) | Ok(AckWait::RouterGone) => {
                self.resolve(&journaled, AuditStatus::DispatchTimeout);
                warn!("[Dispatcher] No ack for unlock {} within {:?}", request_id, self.config.ack_timeout);
                Err(DispatchError::ActuatorUnresponsive { request_id, after: self.config.ack_timeout })
            }
            Err(e) => {
                self.resolve(&journaled, AuditStatus::DispatchFailed);
                warn!("[Dispatcher] Unlock {} not sent: {}", request_id, e);
                Err(e)
            }
        }
    }

    /// Relocks the door. Not journaled.
    pub async fn lock(&self) -> Result<(), DispatchError> {
        let request_id = new_request_id();
        match self.send_and_wait(DoorCommand::LockDoor, &request_id).await? {
            AckWait::Acked(true) => {
                debug!("[Dispatcher] Lock {} acknowledged", request_id);
                Ok(())
            }
            AckWait::Acked(false) => Err(DispatchError::ActuatorRejected { request_id }),
            AckWait::TimedOut | AckWait::RouterGone => {
                Err(DispatchError::ActuatorUnresponsive { request_id, after: self.config.ack_timeout })
            }
        }
    }

    async fn send_and_wait(&self, command: DoorCommand, request_id: &str) -> Result<AckWait, DispatchError> {
        let payload = serde_json::to_vec(&CommandMessage { command, request_id: request_id.to_string() })
            .map_err(|e| DispatchError::Encoding(e.to_string()))?;

        // Registered before publishing so a fast ack cannot slip past.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.to_string(), tx);

        if let Err(e) = self.bus.publish(&self.command_topic, payload).await {
            self.pending.lock().await.remove(request_id);
            return Err(e.into());
        }

        // The router removes the entry when it delivers; on any other exit
        // we clean up so a late ack finds nothing to resolve.
        let waited = match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(ack)) => AckWait::Acked(ack),
            Ok(Err(_)) => AckWait::RouterGone,
            Err(_) => AckWait::TimedOut,
        };
        if !matches!(waited, AckWait::Acked(_)) {
            self.pending.lock().await.remove(request_id);
        }
        Ok(waited)
    }

    fn resolve(&self, pending: &AuditEntry, status: AuditStatus) {
        self.audit.append(AccessAttempt::resolution_of(pending, status));
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Drop for DoorCommandDispatcher {
    fn drop(&mut self) {
        self.ack_router.abort();
    }
}

fn new_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

async fn route_acks(mut acks: mpsc::Receiver<BusMessage>, pending: PendingAcks) {
    while let Some(msg) = acks.recv().await {
        let ack: AckMessage = match serde_json::from_slice(&msg.payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("[Dispatcher] Ignoring malformed ack on {}: {}", msg.topic, e);
                continue;
            }
        };
        match pending.lock().await.remove(&ack.request_id) {
            Some(waiter) => {
                let _ = waiter.send(ack.ack);
            }
            // Late acks never upgrade an already-resolved dispatch.
            None => debug!("[Dispatcher] Ack for unknown or expired request {}", ack.request_id),
        }
    }
    warn!("[Dispatcher] Ack subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;
    use crate::dispatch::endpoint::ActuatorEndpoint;
    use crate::network::EmulatedBroker;
    use crate::test_utils::{test_user, ActuatorBehavior, ManualClock, MockActuator};

    async fn rig(behavior: Option<ActuatorBehavior>) -> (DoorCommandDispatcher, Arc<AuditLog>, MockActuator) {
        let config = AccessConfig::default();
        let broker: Arc<dyn CommandBus> = Arc::new(EmulatedBroker::new(config.bus()));
        let audit = Arc::new(AuditLog::new(Arc::new(ManualClock::default())));
        let actuator = MockActuator::new(behavior.unwrap_or(ActuatorBehavior::Ack));
        if behavior.is_some() {
            ActuatorEndpoint::spawn(Arc::clone(&broker), Arc::new(actuator.clone()), config.endpoint())
                .await
                .unwrap();
        }
        let dispatcher = DoorCommandDispatcher::start(broker, Arc::clone(&audit), config.dispatch()).await.unwrap();
        (dispatcher, audit, actuator)
    }

    fn statuses(audit: &AuditLog) -> Vec<AuditStatus> {
        let mut entries = audit.entries();
        entries.sort_by_key(|e| e.id);
        entries.into_iter().map(|e| e.status).collect()
    }

    #[tokio::test]
    async fn acked_unlock_is_granted() {
        let (dispatcher, audit, actuator) = rig(Some(ActuatorBehavior::Ack)).await;
        let alice = test_user("alice", "5550100001", true, false);
        let receipt = dispatcher.unlock(&alice, AccessMethod::Face).await.unwrap();
        assert_eq!(statuses(&audit), vec![AuditStatus::Pending, AuditStatus::Granted]);
        assert_eq!(audit.entries()[0].resolves, Some(receipt.audit_id));
        assert_eq!(actuator.received(), vec![DoorCommand::UnlockDoor]);
        assert_eq!(dispatcher.in_flight().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_is_dispatch_timeout() {
        let (dispatcher, audit, _) = rig(None).await;
        let alice = test_user("alice", "5550100001", true, false);
        let err = dispatcher.unlock(&alice, AccessMethod::Face).await.unwrap_err();
        assert!(matches!(err, DispatchError::ActuatorUnresponsive { .. }));
        assert!(err.is_retryable());
        assert_eq!(statuses(&audit), vec![AuditStatus::Pending, AuditStatus::DispatchTimeout]);
        assert_eq!(audit.resolved()[0].status, AuditStatus::DispatchTimeout);
        assert_eq!(dispatcher.in_flight().await, 0);
    }

    #[tokio::test]
    async fn nack_is_recorded_as_rejected() {
        let (dispatcher, audit, _) = rig(Some(ActuatorBehavior::Reject)).await;
        let alice = test_user("alice", "5550100001", true, false);
        let err = dispatcher.unlock(&alice, AccessMethod::Otp).await.unwrap_err();
        assert!(matches!(err, DispatchError::ActuatorRejected { .. }));
        assert_eq!(statuses(&audit), vec![AuditStatus::Pending, AuditStatus::ActuatorRejected]);
    }

    #[tokio::test]
    async fn lock_is_not_journaled() {
        let (dispatcher, audit, actuator) = rig(Some(ActuatorBehavior::Ack)).await;
        dispatcher.lock().await.unwrap();
        assert!(audit.is_empty());
        assert_eq!(actuator.received(), vec![DoorCommand::LockDoor]);
    }
}

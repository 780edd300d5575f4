// doorguard-core/tests/dispatch_timeout.rs

// The dispatcher never assumes the door opened: without an ack the attempt
// ends as DISPATCH_TIMEOUT, and nothing later turns it into GRANTED.

use doorguard_core::{
    access::{AccessResult, ApiError},
    audit::AuditStatus,
    config::AccessConfig,
    dispatch::AckMessage,
    network::{ack_topic, CommandBus},
    test_utils::{ActuatorBehavior, DoorRig, BOB_FACE, BOB_PHONE, OTP_CODE},
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn unacked_unlock_is_dispatch_timeout() {
    let rig = DoorRig::builder().presenting(&BOB_FACE).actuator(None).build().await.unwrap();

    let started = rig.controller.start_recognition().await.unwrap();
    let result = rig.controller.wait_handled(started.session_id).await.unwrap();
    assert!(matches!(result, AccessResult::Unavailable { retryable: true, .. }), "got {:?}", result);

    let statuses: Vec<AuditStatus> = rig.controller.audit().entries().iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![AuditStatus::DispatchTimeout, AuditStatus::Pending]);
    assert_eq!(rig.controller.audit_log()[0].status, AuditStatus::DispatchTimeout);
}

#[tokio::test(start_paused = true)]
async fn late_ack_does_not_grant() {
    let rig = DoorRig::builder().presenting(&BOB_FACE).actuator(None).build().await.unwrap();
    let started = rig.controller.start_recognition().await.unwrap();
    rig.controller.wait_handled(started.session_id).await.unwrap();

    let pending = rig
        .controller
        .audit()
        .entries()
        .into_iter()
        .find(|e| e.status == AuditStatus::Pending)
        .expect("pending entry journaled before publish");
    let late = AckMessage { request_id: pending.request_id.clone().unwrap(), ack: true };
    let topic = ack_topic(&AccessConfig::default().device_id);
    rig.broker.publish(&topic, serde_json::to_vec(&late).unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let entries = rig.controller.audit().entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status != AuditStatus::Granted));
}

#[tokio::test(start_paused = true)]
async fn lost_commands_time_out() {
    let mut config = AccessConfig::default();
    config.bus_drop_rate = 1.0;
    let rig = DoorRig::builder().config(config).actuator(Some(ActuatorBehavior::Ack)).build().await.unwrap();

    rig.controller.request_entry(BOB_PHONE).await.unwrap();
    let err = rig.controller.verify_otp(BOB_PHONE, OTP_CODE).await.unwrap_err();
    assert!(matches!(err, ApiError::Unavailable { retryable: true, .. }), "got {:?}", err);
    assert!(rig.actuator.received().is_empty());
    assert_eq!(rig.controller.audit_log()[0].status, AuditStatus::DispatchTimeout);
}

#[tokio::test(start_paused = true)]
async fn stuck_actuator_is_rejected_not_granted() {
    let rig = DoorRig::builder().actuator(Some(ActuatorBehavior::Hang)).build().await.unwrap();

    rig.controller.request_entry(BOB_PHONE).await.unwrap();
    let err = rig.controller.verify_otp(BOB_PHONE, OTP_CODE).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(rig.controller.audit_log()[0].status, AuditStatus::ActuatorRejected);
}

// doorguard-core/tests/session_lifecycle.rs

// Recognition session behaviour as seen through the external interface:
// one session at a time, deadlines, retries and camera recovery.

use doorguard_core::{
    access::{AccessResult, ApiError, RecognitionStage, RecognitionStatus},
    config::AccessConfig,
    liveness::CaptureFault,
    session::SessionOutcome,
    test_utils::{face_of, DoorRig, ScriptedCamera, ScriptedEmbedder, ALICE_FACE},
};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn completed_outcome(status: RecognitionStatus) -> SessionOutcome {
    match status {
        RecognitionStatus::Complete { result, .. } => result.outcome,
        other => panic!("expected complete status, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn second_start_is_a_conflict() {
    let embedder = ScriptedEmbedder::always(Ok(Some(face_of(&ALICE_FACE)))).with_delay(Duration::from_secs(2));
    let rig = DoorRig::builder().embedder(embedder).build().await.unwrap();

    let first = rig.controller.start_recognition().await.unwrap();
    let second = rig.controller.start_recognition().await;
    assert!(matches!(second, Err(ApiError::Conflict(_))), "got {:?}", second);

    match rig.controller.recognition_status().await {
        RecognitionStatus::Running { active, session_id, stage, .. } => {
            assert!(active);
            assert_eq!(session_id, first.session_id);
            assert_eq!(stage, RecognitionStage::Capturing);
        }
        other => panic!("expected running status, got {:?}", other),
    }

    rig.controller.wait_handled(first.session_id).await.unwrap();
    // Once the first session is terminal a new one may start.
    let third = rig.controller.start_recognition().await.unwrap();
    assert_ne!(third.session_id, first.session_id);
}

#[tokio::test(start_paused = true)]
async fn session_times_out_after_sixty_seconds() {
    let mut config = AccessConfig::default();
    config.max_capture_attempts = 10_000;
    let embedder = ScriptedEmbedder::always(Ok(None)).with_delay(Duration::from_secs(1));
    let rig = DoorRig::builder().config(config).embedder(embedder).build().await.unwrap();

    let started = rig.controller.start_recognition().await.unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let result = rig.controller.wait_handled(started.session_id).await.unwrap();
    assert_eq!(result, AccessResult::NoAction);
    assert_eq!(completed_outcome(rig.controller.recognition_status().await), SessionOutcome::TimedOut);
    assert!(rig.actuator.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_face_retries_are_bounded() {
    let rig = DoorRig::builder().embedder(ScriptedEmbedder::always(Ok(None))).build().await.unwrap();

    let started = rig.controller.start_recognition().await.unwrap();
    rig.controller.wait_handled(started.session_id).await.unwrap();
    assert_eq!(completed_outcome(rig.controller.recognition_status().await), SessionOutcome::NoFace);
    assert_eq!(rig.embedder.calls(), AccessConfig::default().max_capture_attempts);
}

#[tokio::test(start_paused = true)]
async fn dropped_frame_then_match_is_seamless() {
    let camera = ScriptedCamera::with_faults(vec![CaptureFault::DroppedFrame]);
    let rig = DoorRig::builder().camera(camera).presenting(&ALICE_FACE).build().await.unwrap();

    let started = rig.controller.start_recognition().await.unwrap();
    let result = rig.controller.wait_handled(started.session_id).await.unwrap();
    assert!(matches!(result, AccessResult::OtpRequired { .. }), "got {:?}", result);
    assert_eq!(rig.camera_resets.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_camera_faults_trigger_reset() {
    let camera = ScriptedCamera::with_faults(vec![CaptureFault::DeviceUnavailable("usb disconnect".into()); 3]);
    let rig = DoorRig::builder().camera(camera).presenting(&ALICE_FACE).build().await.unwrap();

    let started = rig.controller.start_recognition().await.unwrap();
    rig.controller.wait_handled(started.session_id).await.unwrap();
    assert!(matches!(
        completed_outcome(rig.controller.recognition_status().await),
        SessionOutcome::Error { .. }
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while rig.controller.camera_reset_pending() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("camera reset should complete");
    assert_eq!(rig.camera_resets.load(Ordering::SeqCst), 1);

    // The camera is healthy again.
    let next = rig.controller.start_recognition().await.unwrap();
    let result = rig.controller.wait_handled(next.session_id).await.unwrap();
    assert!(matches!(result, AccessResult::OtpRequired { .. }), "got {:?}", result);
}

#[tokio::test(start_paused = true)]
async fn explicit_reset_returns_to_idle() {
    let embedder = ScriptedEmbedder::always(Ok(None)).with_delay(Duration::from_secs(3));
    let rig = DoorRig::builder().embedder(embedder).build().await.unwrap();

    rig.controller.start_recognition().await.unwrap();
    rig.controller.reset_session().await;
    assert_eq!(rig.controller.recognition_status().await, RecognitionStatus::Idle { active: false });
    assert!(rig.controller.start_recognition().await.is_ok());
}

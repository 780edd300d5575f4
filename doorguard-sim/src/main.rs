// doorguard-sim/src/main.rs
// Runs scripted access scenarios against simulated door hardware and prints
// the resulting audit trail. Set RUST_LOG=debug for per-message detail.
//
// Usage: doorguard-sim [config.json]

use chrono::Duration as ChronoDuration;
use doorguard_core::{
    access::{AccessResult, ApiError},
    config::AccessConfig,
    test_utils::{DoorRig, ALICE_FACE, ALICE_PHONE, BOB_FACE, MALLORY_FACE, OTP_CODE},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn recognize(rig: &DoorRig) -> Result<AccessResult, ApiError> {
    let started = rig.controller.start_recognition().await?;
    info!(session = %started.session_id, "recognition started");
    rig.controller.wait_handled(started.session_id).await
}

fn print_audit(name: &str, rig: &DoorRig) -> Result<(), ApiError> {
    let rows = rig.controller.audit_log();
    let json = serde_json::to_string_pretty(&rows).map_err(|e| ApiError::Fatal(e.to_string()))?;
    println!("--- {} ---\n{}", name, json);
    if let Err(e) = rig.controller.audit().verify_chain() {
        warn!("audit chain check failed: {}", e);
    }
    Ok(())
}

async fn face_and_otp(config: &AccessConfig) -> Result<(), ApiError> {
    let rig = DoorRig::builder().config(config.clone()).presenting(&ALICE_FACE).build().await?;
    let result = recognize(&rig).await?;
    info!(?result, "alice recognized");
    if let AccessResult::OtpRequired { .. } = result {
        rig.clock.advance(ChronoDuration::seconds(40));
        let response = rig.controller.verify_otp(ALICE_PHONE, OTP_CODE).await?;
        info!(status = ?response.status, "alice submitted her code");
    }
    print_audit("face + otp", &rig)
}

async fn low_security_face(config: &AccessConfig) -> Result<(), ApiError> {
    let rig = DoorRig::builder().config(config.clone()).presenting(&BOB_FACE).build().await?;
    let result = recognize(&rig).await?;
    info!(?result, "bob recognized");
    print_audit("low security face", &rig)
}

async fn disallowed_and_spoof(config: &AccessConfig) -> Result<(), ApiError> {
    let rig = DoorRig::builder().config(config.clone()).presenting(&MALLORY_FACE).build().await?;
    let result = recognize(&rig).await?;
    info!(?result, "mallory recognized");

    let spoof = DoorRig::builder().config(config.clone()).presenting(&ALICE_FACE).liveness_score(0.05).build().await?;
    let result = recognize(&spoof).await?;
    info!(?result, "photo of alice held up to the camera");

    print_audit("disallowed user", &rig)?;
    print_audit("spoof attempt", &spoof)
}

async fn unresponsive_actuator(config: &AccessConfig) -> Result<(), ApiError> {
    let rig = DoorRig::builder().config(config.clone()).presenting(&BOB_FACE).actuator(None).build().await?;
    let result = recognize(&rig).await?;
    info!(?result, "bob recognized with the actuator offline");
    print_audit("unresponsive actuator", &rig)
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config = match std::env::args().nth(1) {
        Some(path) => match AccessConfig::from_json_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("could not load {}: {}; using defaults", path, e);
                AccessConfig::default()
            }
        },
        None => AccessConfig::default(),
    };

    info!(device = %config.device_id, "doorguard simulation starting");
    let scenarios = [
        ("face + otp", face_and_otp(&config).await),
        ("low security face", low_security_face(&config).await),
        ("disallowed and spoof", disallowed_and_spoof(&config).await),
        ("unresponsive actuator", unresponsive_actuator(&config).await),
    ];
    for (name, outcome) in scenarios {
        match outcome {
            Ok(()) => info!("scenario '{}' finished", name),
            Err(e) => warn!("scenario '{}' failed: {}", name, e),
        }
    }
}

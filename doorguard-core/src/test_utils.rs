// doorguard-core/src/test_utils.rs
// Scripted stand-ins for the external collaborators, shared by unit and
// integration tests and the simulator.

use crate::access::{AccessController, ApiError, Collaborators};
use crate::clock::Clock;
use crate::config::AccessConfig;
use crate::data_structures::{GlobalSchedule, GlobalScheduleEntry, User, UserId};
use crate::directory::{InMemoryDirectory, ScheduleStore, StoredEncoding};
use crate::dispatch::{ActuatorEndpoint, DoorActuator, DoorCommand};
use crate::liveness::{BoundingBox, CaptureFault, Embedding, FaceDetection, FaceEmbedder, Frame, LivenessScorer};
use crate::network::{CommandBus, EmulatedBroker};
use crate::otp::{OtpProvider, ProviderError, ProviderVerdict};
use crate::session::CameraSource;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use ed25519_dalek::SigningKey;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_user(id: &str, phone: &str, is_allowed: bool, low_security: bool) -> User {
    User {
        id: UserId::new(id),
        display_name: Some(format!("{}{}", id[..1].to_uppercase(), &id[1..])),
        phone_number: phone.to_string(),
        is_allowed,
        low_security,
        encoding_ids: Vec::new(),
    }
}

/// Deterministic signing key, one per seed byte.
pub fn test_signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn test_frame(sequence: u64) -> Frame {
    Frame { sequence, width: 640, height: 480, data: Arc::from(vec![0u8; 16]) }
}

/// Square box at the origin whose diagonal is as close to `diagonal` as whole
/// pixels allow.
pub fn bbox_with_diagonal(diagonal: f64) -> BoundingBox {
    let side = (diagonal / std::f64::consts::SQRT_2).round() as u32;
    BoundingBox { top: 0, right: side, bottom: side, left: 0 }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// --- Clock ---

/// Wall clock that only moves when told to. Starts Monday 2025-03-03 10:00 UTC.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        ManualClock { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = lock(&self.now);
        *now = *now + by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::at(Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).single().unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// --- Camera ---

/// Camera that fails with the scripted faults first, then delivers frames.
pub struct ScriptedCamera {
    faults: Mutex<VecDeque<CaptureFault>>,
    sequence: AtomicU64,
    resets: Arc<AtomicUsize>,
    delay: Duration,
}

impl ScriptedCamera {
    pub fn healthy() -> Self {
        ScriptedCamera::with_faults(Vec::new())
    }

    pub fn with_faults(faults: Vec<CaptureFault>) -> Self {
        ScriptedCamera {
            faults: Mutex::new(faults.into()),
            sequence: AtomicU64::new(0),
            resets: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn reset_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.resets)
    }
}

#[async_trait]
impl CameraSource for ScriptedCamera {
    async fn capture_frame(&self) -> Result<Frame, CaptureFault> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(fault) = lock(&self.faults).pop_front() {
            return Err(fault);
        }
        Ok(test_frame(self.sequence.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn reset(&self) -> Result<(), CaptureFault> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// --- Models ---

/// Embedder replaying a script of results; the last entry repeats.
#[derive(Clone)]
pub struct ScriptedEmbedder {
    script: Arc<Mutex<VecDeque<Result<Option<FaceDetection>, CaptureFault>>>>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl ScriptedEmbedder {
    pub fn always(result: Result<Option<FaceDetection>, CaptureFault>) -> Self {
        ScriptedEmbedder::sequence(vec![result])
    }

    pub fn sequence(results: Vec<Result<Option<FaceDetection>, CaptureFault>>) -> Self {
        ScriptedEmbedder {
            script: Arc::new(Mutex::new(results.into())),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceEmbedder for ScriptedEmbedder {
    async fn detect_and_embed(&self, _frame: &Frame) -> Result<Option<FaceDetection>, CaptureFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut script = lock(&self.script);
        if script.len() > 1 {
            script.pop_front().unwrap_or(Ok(None))
        } else {
            script.front().cloned().unwrap_or(Ok(None))
        }
    }
}

#[derive(Clone)]
pub struct ScriptedLiveness {
    result: Result<f64, CaptureFault>,
}

impl ScriptedLiveness {
    pub fn always(result: Result<f64, CaptureFault>) -> Self {
        ScriptedLiveness { result }
    }
}

#[async_trait]
impl LivenessScorer for ScriptedLiveness {
    async fn score(&self, _frame: &Frame, _face: &BoundingBox) -> Result<f64, CaptureFault> {
        self.result.clone()
    }
}

// --- OTP provider ---

enum ProviderMode {
    Accepting(String),
    Unavailable,
}

/// Provider that approves exactly one code, or is down.
pub struct MockOtpProvider {
    mode: ProviderMode,
    delay: Mutex<Duration>,
    issued: Mutex<Vec<String>>,
    confirms: AtomicUsize,
}

impl MockOtpProvider {
    pub fn accepting(code: &str) -> Self {
        MockOtpProvider::with_mode(ProviderMode::Accepting(code.to_string()))
    }

    pub fn unavailable() -> Self {
        MockOtpProvider::with_mode(ProviderMode::Unavailable)
    }

    fn with_mode(mode: ProviderMode) -> Self {
        MockOtpProvider {
            mode,
            delay: Mutex::new(Duration::ZERO),
            issued: Mutex::new(Vec::new()),
            confirms: AtomicUsize::new(0),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn issued_to(&self) -> Vec<String> {
        lock(&self.issued).clone()
    }

    pub fn confirm_calls(&self) -> usize {
        self.confirms.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl OtpProvider for MockOtpProvider {
    async fn issue(&self, phone: &str) -> Result<(), ProviderError> {
        self.pause().await;
        match &self.mode {
            ProviderMode::Accepting(_) => {
                lock(&self.issued).push(phone.to_string());
                Ok(())
            }
            ProviderMode::Unavailable => Err(ProviderError::Unreachable("mock provider down".into())),
        }
    }

    async fn confirm(&self, _phone: &str, code: &str) -> Result<ProviderVerdict, ProviderError> {
        self.confirms.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        match &self.mode {
            ProviderMode::Accepting(expected) if expected == code => Ok(ProviderVerdict::Approved),
            ProviderMode::Accepting(_) => Ok(ProviderVerdict::Denied),
            ProviderMode::Unavailable => Err(ProviderError::Unreachable("mock provider down".into())),
        }
    }
}

// --- Actuator ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActuatorBehavior {
    Ack,
    Reject,
    Hang,
}

/// Door driver recording every command it receives.
#[derive(Clone)]
pub struct MockActuator {
    behavior: Arc<Mutex<ActuatorBehavior>>,
    received: Arc<Mutex<Vec<DoorCommand>>>,
}

impl MockActuator {
    pub fn new(behavior: ActuatorBehavior) -> Self {
        MockActuator { behavior: Arc::new(Mutex::new(behavior)), received: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn set_behavior(&self, behavior: ActuatorBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn received(&self) -> Vec<DoorCommand> {
        lock(&self.received).clone()
    }
}

#[async_trait]
impl DoorActuator for MockActuator {
    async fn send_command(&self, command: DoorCommand) -> bool {
        lock(&self.received).push(command);
        let behavior = *lock(&self.behavior);
        match behavior {
            ActuatorBehavior::Ack => true,
            ActuatorBehavior::Reject => false,
            ActuatorBehavior::Hang => std::future::pending::<bool>().await,
        }
    }
}

// --- Assembled door ---

pub const ALICE_PHONE: &str = "+1 555 010 0001";
pub const BOB_PHONE: &str = "+1 555 010 0002";
pub const MALLORY_PHONE: &str = "+1 555 010 0009";
pub const OTP_CODE: &str = "246810";

pub const ALICE_FACE: [f64; 2] = [0.0, 0.0];
pub const BOB_FACE: [f64; 2] = [1.0, 1.0];
pub const MALLORY_FACE: [f64; 2] = [-1.0, 1.0];

/// Live face of a comfortable size with the given embedding.
pub fn face_of(embedding: &[f64]) -> FaceDetection {
    FaceDetection { bbox: bbox_with_diagonal(200.0), embedding: Embedding(embedding.to_vec()) }
}

/// Monday to Friday 08:00-18:00, weekends closed.
pub fn office_hours() -> GlobalSchedule {
    let weekday = |day| match (NaiveTime::from_hms_opt(8, 0, 0), NaiveTime::from_hms_opt(18, 0, 0)) {
        (Some(open), Some(close)) => GlobalScheduleEntry::open(day, open, close),
        _ => GlobalScheduleEntry::closed(day),
    };
    let workdays = [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri].map(weekday);
    let weekend = [Weekday::Sat, Weekday::Sun].map(GlobalScheduleEntry::closed);
    GlobalSchedule::new(workdays.into_iter().chain(weekend))
}

/// Controller wired to scripted collaborators: alice (OTP required), bob
/// (low security) and mallory (disallowed) are enrolled; the clock starts
/// Monday 10:00 site time.
pub struct DoorRig {
    pub controller: AccessController,
    pub directory: Arc<InMemoryDirectory>,
    pub clock: Arc<ManualClock>,
    pub otp: Arc<MockOtpProvider>,
    pub actuator: MockActuator,
    pub embedder: ScriptedEmbedder,
    pub broker: Arc<EmulatedBroker>,
    pub camera_resets: Arc<AtomicUsize>,
}

pub struct DoorRigBuilder {
    config: AccessConfig,
    camera: ScriptedCamera,
    embedder: ScriptedEmbedder,
    liveness: ScriptedLiveness,
    otp: MockOtpProvider,
    actuator: Option<ActuatorBehavior>,
    enroll: bool,
}

impl DoorRig {
    pub fn builder() -> DoorRigBuilder {
        DoorRigBuilder {
            config: AccessConfig::default(),
            camera: ScriptedCamera::healthy(),
            embedder: ScriptedEmbedder::always(Ok(None)),
            liveness: ScriptedLiveness::always(Ok(0.95)),
            otp: MockOtpProvider::accepting(OTP_CODE),
            actuator: Some(ActuatorBehavior::Ack),
            enroll: true,
        }
    }
}

impl DoorRigBuilder {
    pub fn config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn presenting(self, embedding: &[f64]) -> Self {
        self.embedder(ScriptedEmbedder::always(Ok(Some(face_of(embedding)))))
    }

    pub fn embedder(mut self, embedder: ScriptedEmbedder) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn liveness_score(mut self, score: f64) -> Self {
        self.liveness = ScriptedLiveness::always(Ok(score));
        self
    }

    pub fn camera(mut self, camera: ScriptedCamera) -> Self {
        self.camera = camera;
        self
    }

    pub fn otp_provider(mut self, otp: MockOtpProvider) -> Self {
        self.otp = otp;
        self
    }

    /// `None` leaves the command topic without a listener.
    pub fn actuator(mut self, behavior: Option<ActuatorBehavior>) -> Self {
        self.actuator = behavior;
        self
    }

    pub fn empty_store(mut self) -> Self {
        self.enroll = false;
        self
    }

    pub async fn build(self) -> Result<DoorRig, ApiError> {
        let clock = Arc::new(ManualClock::default());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.replace_schedule(office_hours());
        let people = [
            (test_user("alice", ALICE_PHONE, true, false), ALICE_FACE),
            (test_user("bob", BOB_PHONE, true, true), BOB_FACE),
            (test_user("mallory", MALLORY_PHONE, false, false), MALLORY_FACE),
        ];
        for (i, (user, face)) in people.into_iter().enumerate() {
            let id = user.id.clone();
            directory.upsert_user(user);
            if self.enroll {
                directory.add_encoding(StoredEncoding { encoding_id: i as u64 + 1, user_id: id, embedding: Embedding(face.to_vec()) });
            }
        }

        let broker = Arc::new(EmulatedBroker::new(self.config.bus()));
        let actuator = MockActuator::new(self.actuator.unwrap_or(ActuatorBehavior::Ack));
        if self.actuator.is_some() {
            let bus: Arc<dyn CommandBus> = broker.clone();
            ActuatorEndpoint::spawn(bus, Arc::new(actuator.clone()), self.config.endpoint())
                .await
                .map_err(|e| ApiError::Unavailable { reason: e.to_string(), retryable: false })?;
        }

        let camera_resets = self.camera.reset_counter();
        let otp = Arc::new(self.otp);
        let controller = AccessController::start(
            self.config,
            Collaborators {
                clock: clock.clone(),
                directory: directory.clone(),
                camera: Arc::new(self.camera),
                embedder: Arc::new(self.embedder.clone()),
                liveness: Arc::new(self.liveness),
                otp_provider: otp.clone(),
                bus: broker.clone(),
                schedule_store: Some(directory.clone() as Arc<dyn ScheduleStore>),
                signing_key: Some(test_signing_key(42)),
            },
        )
        .await?;

        Ok(DoorRig {
            controller,
            directory,
            clock,
            otp,
            actuator,
            embedder: self.embedder,
            broker,
            camera_resets,
        })
    }
}

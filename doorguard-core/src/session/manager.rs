// Drives one capture/evaluate cycle at a time on a dedicated worker task and
// exposes its progress through a watch snapshot that pollers read without
// touching the worker.

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::liveness::{AdapterError, AdapterStage, Classification, LivenessMatchAdapter, Screening};
use crate::session::camera::{CameraLease, CameraResource};
use crate::session::types::{
    CameraResetSignal, SessionError, SessionId, SessionOutcome, SessionSnapshot, SessionState,
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// The one "current session" handle.
struct ActiveSession {
    id: SessionId,
    cancel: Option<oneshot::Sender<()>>,
    worker: JoinHandle<()>,
}

struct Slot {
    current: Option<ActiveSession>,
    next_id: u64,
}

struct Shared {
    adapter: Arc<LivenessMatchAdapter>,
    camera: Arc<CameraResource>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SessionSnapshot>,
    reset_pending: AtomicBool,
    resets: broadcast::Sender<CameraResetSignal>,
}

impl Shared {
    /// Applies `update` only while `id` is still the published session, so a
    /// superseded worker can never overwrite its successor.
    fn publish(&self, id: SessionId, update: impl FnOnce(&mut SessionState)) {
        let now = self.clock.now();
        self.state.send_if_modified(|snap| {
            if snap.session != Some(id) {
                return false;
            }
            update(&mut snap.state);
            snap.last_activity = Some(now);
            true
        });
    }
}

pub struct SessionManager {
    shared: Arc<Shared>,
    slot: Mutex<Slot>,
    halted: AtomicBool,
}

enum Step {
    Done(SessionOutcome),
    Retry,
}

impl SessionManager {
    pub fn new(
        adapter: Arc<LivenessMatchAdapter>,
        camera: Arc<CameraResource>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::idle());
        let (resets, _) = broadcast::channel(16);
        SessionManager {
            shared: Arc::new(Shared {
                adapter,
                camera,
                config,
                clock,
                state,
                reset_pending: AtomicBool::new(false),
                resets,
            }),
            slot: Mutex::new(Slot { current: None, next_id: 1 }),
            halted: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts a new session, or fails immediately if one is still running.
    pub fn start(&self) -> Result<SessionId, SessionError> {
        if self.halted.load(Ordering::Acquire) {
            return Err(SessionError::Halted);
        }
        let mut slot = self.slot();
        if self.shared.reset_pending.load(Ordering::Acquire) {
            return Err(SessionError::CameraResetPending);
        }
        if self.shared.state.borrow().state.is_running() {
            debug!("[SessionManager] start() refused: session already active");
            return Err(SessionError::AlreadyActive);
        }

        let id = SessionId(slot.next_id);
        slot.next_id += 1;

        let Some(lease) = self.shared.camera.try_acquire(id) else {
            // No session is running, yet the camera is held.
            error!("[SessionManager] Invariant violated: camera held while no session is active; halting new sessions");
            self.halted.store(true, Ordering::Release);
            return Err(SessionError::Halted);
        };

        let deadline = Instant::now() + self.shared.config.deadline;
        let now = self.shared.clock.now();
        self.shared.state.send_replace(SessionSnapshot {
            session: Some(id),
            state: SessionState::Capturing { attempt: 1 },
            started_at: Some(now),
            last_activity: Some(now),
            deadline: Some(deadline),
        });

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = tokio::spawn(run_session(Arc::clone(&self.shared), id, lease, deadline, cancel_rx));
        slot.current = Some(ActiveSession { id, cancel: Some(cancel_tx), worker });
        info!("[SessionManager] {} started (deadline {:?})", id, self.shared.config.deadline);
        Ok(id)
    }

    /// Non-blocking, read-only view of the current session. A running
    /// session past its deadline reads as `TIMED_OUT` even if the worker has
    /// not taken its next step yet.
    pub fn poll(&self) -> SessionSnapshot {
        let mut snap = self.shared.state.borrow().clone();
        if snap.is_overdue(Instant::now()) {
            snap.state = SessionState::Finished(SessionOutcome::TimedOut);
        }
        snap
    }

    /// Waits until session `id` reaches a terminal state.
    pub async fn wait_terminal(&self, id: SessionId) -> Result<SessionOutcome, SessionError> {
        let mut rx = self.shared.state.subscribe();
        let snap = rx
            .wait_for(|s| s.session != Some(id) || s.state.outcome().is_some())
            .await
            .map_err(|_| SessionError::NotFound(id))?;
        if snap.session != Some(id) {
            return Err(SessionError::NotFound(id));
        }
        snap.state.outcome().cloned().ok_or(SessionError::NotTerminal(id))
    }

    /// Hands the terminal result of `id` to the caller and moves the session
    /// to `COMPLETE`. The session handle is dropped.
    pub fn consume(&self, id: SessionId) -> Result<SessionOutcome, SessionError> {
        let mut slot = self.slot();
        let mut result = Err(SessionError::NotFound(id));
        self.shared.state.send_if_modified(|snap| {
            if snap.session != Some(id) {
                return false;
            }
            match &snap.state {
                SessionState::Finished(outcome) => {
                    let outcome = outcome.clone();
                    snap.state = SessionState::Complete(outcome.clone());
                    result = Ok(outcome);
                    true
                }
                SessionState::Complete(outcome) => {
                    result = Ok(outcome.clone());
                    false
                }
                _ => {
                    result = Err(SessionError::NotTerminal(id));
                    false
                }
            }
        });
        if result.is_ok() && slot.current.as_ref().map(|s| s.id) == Some(id) {
            slot.current = None;
            debug!("[SessionManager] {} consumed", id);
        }
        result
    }

    /// Explicit reset: cancels any in-flight session, waits for its worker to
    /// release the camera, and returns the manager to `IDLE`.
    pub async fn reset(&self) {
        // Remember which session the snapshot showed when the handle was
        // taken. A start() that wins the slot while we wait on the worker
        // publishes its own session, and that one must survive.
        let (active, shown) = {
            let mut slot = self.slot();
            let shown = self.shared.state.borrow().session;
            (slot.current.take(), shown)
        };
        if let Some(mut active) = active {
            if let Some(cancel) = active.cancel.take() {
                let _ = cancel.send(());
            }
            if let Err(e) = active.worker.await {
                error!("[SessionManager] Worker for {} ended abnormally: {}", active.id, e);
            }
            info!("[SessionManager] {} reset", active.id);
        }

        let _slot = self.slot();
        let cleared = self.shared.state.send_if_modified(|snap| {
            if shown.is_none() || snap.session != shown {
                return false;
            }
            *snap = SessionSnapshot::idle();
            true
        });
        if !cleared && shown.is_some() {
            debug!("[SessionManager] Reset left the newer session in place");
        }
    }

    /// Resets the camera hardware after a reset signal and reopens
    /// `start()`.
    pub async fn reset_camera(&self) -> Result<(), SessionError> {
        let timeout = self.shared.config.adapter_call_timeout;
        match tokio::time::timeout(timeout, self.shared.camera.reset_device()).await {
            Ok(Ok(())) => {
                self.shared.reset_pending.store(false, Ordering::Release);
                info!("[SessionManager] Camera reset complete; new sessions allowed");
                Ok(())
            }
            Ok(Err(fault)) => {
                warn!("[SessionManager] Camera reset failed: {}", fault);
                Err(SessionError::CameraUnavailable(fault.to_string()))
            }
            Err(_) => {
                warn!("[SessionManager] Camera reset exceeded {:?}", timeout);
                Err(SessionError::CameraUnavailable(format!("no response within {:?}", timeout)))
            }
        }
    }

    pub fn camera_reset_pending(&self) -> bool {
        self.shared.reset_pending.load(Ordering::Acquire)
    }

    pub fn reset_signals(&self) -> broadcast::Receiver<CameraResetSignal> {
        self.shared.resets.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

async fn run_session(
    shared: Arc<Shared>,
    id: SessionId,
    lease: CameraLease,
    deadline: Instant,
    mut cancel: oneshot::Receiver<()>,
) {
    let outcome = tokio::select! {
        outcome = drive(&shared, id, &lease, deadline) => Some(outcome),
        _ = tokio::time::sleep_until(deadline) => Some(SessionOutcome::TimedOut),
        _ = &mut cancel => None,
    };

    // Camera goes back before the terminal state becomes visible, so a
    // caller that sees the result can start the next session immediately.
    lease.release();
    match outcome {
        Some(outcome) => {
            info!("[SessionManager] {} finished: {}", id, outcome.label());
            shared.publish(id, |state| *state = SessionState::Finished(outcome));
        }
        None => debug!("[SessionManager] {} cancelled", id),
    }
}

async fn drive(shared: &Shared, id: SessionId, lease: &CameraLease, deadline: Instant) -> SessionOutcome {
    let config = &shared.config;
    let mut attempt = 0usize;
    let mut consecutive_faults = 0usize;

    loop {
        if Instant::now() >= deadline {
            return SessionOutcome::TimedOut;
        }
        attempt += 1;
        shared.publish(id, |state| *state = SessionState::Capturing { attempt });

        let step = match capture_and_classify(shared, id, lease).await {
            Ok(Classification::NoFace) => {
                consecutive_faults = 0;
                if attempt >= config.max_capture_attempts {
                    Step::Done(SessionOutcome::NoFace)
                } else {
                    debug!("[SessionManager] {} attempt {}: no face, retrying", id, attempt);
                    Step::Retry
                }
            }
            Ok(Classification::FaceTooSmall { feedback }) => Step::Done(SessionOutcome::FaceTooSmall { feedback }),
            Ok(Classification::LivenessFailed) => Step::Done(SessionOutcome::LivenessFailed),
            Ok(Classification::Matched(user)) => Step::Done(SessionOutcome::Matched { user }),
            Ok(Classification::Unmatched) => Step::Done(SessionOutcome::Unmatched),
            Ok(Classification::RegistrationNeeded) => Step::Done(SessionOutcome::RegistrationNeeded),
            Err(e) if e.is_transient() => {
                consecutive_faults += 1;
                warn!(
                    "[SessionManager] {} attempt {}: transient failure ({}/{}): {}",
                    id, attempt, consecutive_faults, config.camera_fault_limit, e
                );
                if consecutive_faults >= config.camera_fault_limit {
                    raise_reset_signal(shared, id, consecutive_faults, &e);
                    Step::Done(SessionOutcome::Error { reason: format!("camera reset needed: {}", e) })
                } else if attempt >= config.max_capture_attempts {
                    Step::Done(SessionOutcome::Error { reason: e.to_string() })
                } else {
                    Step::Retry
                }
            }
            Err(e) => {
                warn!("[SessionManager] {} failed: {}", id, e);
                Step::Done(SessionOutcome::Error { reason: e.to_string() })
            }
        };

        match step {
            Step::Done(outcome) => return outcome,
            Step::Retry => tokio::time::sleep(config.retry_backoff).await,
        }
    }
}

async fn capture_and_classify(
    shared: &Shared,
    id: SessionId,
    lease: &CameraLease,
) -> Result<Classification, AdapterError> {
    let after = shared.adapter.call_timeout();
    let frame = match tokio::time::timeout(after, lease.capture()).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(fault)) => return Err(AdapterError::Fault { stage: AdapterStage::Capture, fault }),
        Err(_) => return Err(AdapterError::Timeout { stage: AdapterStage::Capture, after }),
    };

    match shared.adapter.screen(&frame).await? {
        Screening::NoFace => Ok(Classification::NoFace),
        Screening::FaceTooSmall { feedback, .. } => Ok(Classification::FaceTooSmall { feedback }),
        Screening::LivenessFailed { .. } => Ok(Classification::LivenessFailed),
        Screening::Live { detection, .. } => {
            shared.publish(id, |state| *state = SessionState::Matching);
            shared.adapter.match_live(&detection.embedding).await
        }
    }
}

fn raise_reset_signal(shared: &Shared, id: SessionId, consecutive_faults: usize, last: &AdapterError) {
    shared.reset_pending.store(true, Ordering::Release);
    warn!(
        "[SessionManager] {} consecutive camera faults in {}; camera reset required",
        consecutive_faults, id
    );
    // No subscribers is fine; the pending flag still gates start().
    let _ = shared.resets.send(CameraResetSignal {
        session: id,
        consecutive_faults,
        last_fault: last.to_string(),
    });
}

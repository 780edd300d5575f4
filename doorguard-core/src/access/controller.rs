// Wires the components into the door's access flow and serves the external
// interface: recognition start/status, OTP entry and verification, audit
// reads and camera recovery.

use crate::access::api::{
    AccessResult, ApiError, EntryRequestResponse, RecognitionStatus, StartRecognitionResponse, VerifyOtpResponse,
};
use crate::audit::{AccessAttempt, AuditLog, AuditRecordView, AuditStatus};
use crate::clock::Clock;
use crate::config::AccessConfig;
use crate::data_structures::{AccessMethod, User, UserId};
use crate::directory::{AccessDirectory, ScheduleStore};
use crate::dispatch::DoorCommandDispatcher;
use crate::liveness::{FaceEmbedder, LivenessMatchAdapter, LivenessScorer, MatchedUser};
use crate::network::CommandBus;
use crate::otp::{normalize_phone, OtpCoordinator, OtpError, OtpProvider, VerifyOutcome};
use crate::policy::{AccessDecision, AccessPolicy, ScheduleListener};
use crate::session::{CameraResource, CameraSource, SessionId, SessionManager, SessionOutcome};
use crate::token::TokenIssuer;
use ed25519_dalek::SigningKey;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

// Handled-session results kept for status polling.
const RESULT_HISTORY: u64 = 32;

/// External capabilities the controller is wired against.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<dyn AccessDirectory>,
    pub camera: Arc<dyn CameraSource>,
    pub embedder: Arc<dyn FaceEmbedder>,
    pub liveness: Arc<dyn LivenessScorer>,
    pub otp_provider: Arc<dyn OtpProvider>,
    pub bus: Arc<dyn CommandBus>,
    /// Where schedule updates from the bus are written. No feed when absent.
    pub schedule_store: Option<Arc<dyn ScheduleStore>>,
    /// Token signing key; a random one is generated when absent.
    pub signing_key: Option<SigningKey>,
}

// An outstanding second factor, keyed by normalized phone number.
#[derive(Clone, Debug)]
struct PendingFactor {
    user_id: UserId,
    method: AccessMethod,
}

struct Inner {
    config: AccessConfig,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn AccessDirectory>,
    sessions: SessionManager,
    otp: OtpCoordinator,
    dispatcher: DoorCommandDispatcher,
    audit: Arc<AuditLog>,
    tokens: TokenIssuer,
    second_factors: Mutex<HashMap<String, PendingFactor>>,
    results: Mutex<HashMap<SessionId, AccessResult>>,
    handled: Notify,
    schedule_feed: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(feed) = self.schedule_feed.take() {
            feed.abort();
        }
    }
}

#[derive(Clone)]
pub struct AccessController {
    inner: Arc<Inner>,
}

impl AccessController {
    pub async fn start(config: AccessConfig, deps: Collaborators) -> Result<Self, ApiError> {
        config.validate().map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        let adapter = LivenessMatchAdapter::new(
            deps.embedder,
            deps.liveness,
            Arc::clone(&deps.directory),
            config.thresholds(),
            config.adapter_call_timeout,
        );
        let sessions = SessionManager::new(
            Arc::new(adapter),
            CameraResource::new(deps.camera),
            config.session(),
            Arc::clone(&deps.clock),
        );
        let audit = Arc::new(AuditLog::new(Arc::clone(&deps.clock)));
        let schedule_feed = match deps.schedule_store {
            Some(store) => Some(
                ScheduleListener::spawn(Arc::clone(&deps.bus), store)
                    .await
                    .map_err(|e| ApiError::Unavailable { reason: e.to_string(), retryable: true })?,
            ),
            None => None,
        };
        let dispatcher = DoorCommandDispatcher::start(deps.bus, Arc::clone(&audit), config.dispatch()).await?;
        let otp = OtpCoordinator::new(deps.otp_provider, Arc::clone(&deps.clock), config.otp());
        let tokens = match deps.signing_key {
            Some(key) => TokenIssuer::new(key, config.token_ttl, Arc::clone(&deps.clock)),
            None => TokenIssuer::generate(config.token_ttl, Arc::clone(&deps.clock)),
        };

        let resets = sessions.reset_signals();
        let inner = Arc::new(Inner {
            clock: deps.clock,
            directory: deps.directory,
            sessions,
            otp,
            dispatcher,
            audit,
            tokens,
            second_factors: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            handled: Notify::new(),
            schedule_feed,
            config,
        });
        // Ends once the session manager (and its signal channel) is dropped.
        tokio::spawn(watch_camera_resets(Arc::downgrade(&inner), resets));
        info!("[AccessController] Started for device {}", inner.config.device_id);
        Ok(AccessController { inner })
    }

    /// `POST start-recognition`
    pub async fn start_recognition(&self) -> Result<StartRecognitionResponse, ApiError> {
        let session_id = self.inner.sessions.start()?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.follow_up(session_id).await });
        Ok(StartRecognitionResponse { started: true, session_id })
    }

    /// `GET recognition-status`. Never waits on the session worker.
    pub async fn recognition_status(&self) -> RecognitionStatus {
        let snap = self.inner.sessions.poll();
        let access = match snap.session {
            Some(id) => self.inner.results.lock().await.get(&id).cloned(),
            None => None,
        };
        RecognitionStatus::from_snapshot(&snap, access)
    }

    /// Phone-only entry: sends a code if the policy would admit the user now.
    pub async fn request_entry(&self, phone: &str) -> Result<EntryRequestResponse, ApiError> {
        let digits = normalize_phone(phone)?;
        let user = match self.inner.directory.user_by_phone(&digits).await? {
            Some(user) => user,
            None => {
                warn!("[AccessController] Entry requested for unknown phone");
                self.inner.journal(None, AccessMethod::Otp, AuditStatus::Denied);
                return Err(ApiError::Denied("unknown phone number".into()));
            }
        };

        if self.inner.decide(&user).await? == AccessDecision::Deny {
            self.inner.journal(Some(&user), AccessMethod::Otp, AuditStatus::Denied);
            return Err(ApiError::Denied("outside permitted access times".into()));
        }

        let expires_at = self.inner.issue_second_factor(&user, AccessMethod::Otp).await?;
        Ok(EntryRequestResponse { otp_sent: true, expires_at })
    }

    /// `POST verify-otp`
    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<VerifyOtpResponse, ApiError> {
        self.inner.verify_otp(phone, code).await
    }

    /// Audit read model, newest attempt first.
    pub fn audit_log(&self) -> Vec<AuditRecordView> {
        self.inner.audit.resolved()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.inner.audit)
    }

    pub async fn lock_door(&self) -> Result<(), ApiError> {
        Ok(self.inner.dispatcher.lock().await?)
    }

    /// Abandons any in-flight session and returns to idle.
    pub async fn reset_session(&self) {
        self.inner.sessions.reset().await;
    }

    pub async fn reset_camera(&self) -> Result<(), ApiError> {
        Ok(self.inner.sessions.reset_camera().await?)
    }

    pub fn camera_reset_pending(&self) -> bool {
        self.inner.sessions.camera_reset_pending()
    }

    /// Waits for `session` to be fully handled (terminal result acted on).
    pub async fn wait_handled(&self, session: SessionId) -> Result<AccessResult, ApiError> {
        loop {
            let handled = self.inner.handled.notified();
            if let Some(result) = self.inner.results.lock().await.get(&session).cloned() {
                return Ok(result);
            }
            self.inner.sessions.wait_terminal(session).await?;
            handled.await;
        }
    }

    pub fn verify_token(&self, token: &str) -> Result<crate::token::AccessClaims, ApiError> {
        self.inner.tokens.verify(token).map_err(|e| ApiError::Denied(e.to_string()))
    }
}

impl Inner {
    async fn decide(&self, user: &User) -> Result<AccessDecision, ApiError> {
        let schedule = self.directory.global_schedule().await?;
        let windows = self.directory.user_windows(&user.id).await?;
        let now = self.clock.now().with_timezone(&self.config.site_offset()).naive_local();
        let (decision, rule) = AccessPolicy::new(schedule, windows).decide_with_rule(user, now);
        info!("[AccessController] Policy for {} at {}: {:?} ({:?})", user.id, now, decision, rule);
        Ok(decision)
    }

    fn journal(&self, user: Option<&User>, method: AccessMethod, status: AuditStatus) {
        self.audit.append(AccessAttempt::new(
            user.map(|u| u.id.clone()),
            user.and_then(|u| u.display_name.clone()),
            method,
            status,
        ));
    }

    async fn issue_second_factor(&self, user: &User, method: AccessMethod) -> Result<chrono::DateTime<chrono::Utc>, ApiError> {
        match self.otp.issue(&user.phone_number).await {
            Ok(record) => {
                self.second_factors
                    .lock()
                    .await
                    .insert(record.phone.clone(), PendingFactor { user_id: user.id.clone(), method });
                self.journal(Some(user), method, AuditStatus::OtpRequired);
                Ok(record.expires_at)
            }
            Err(e) => {
                let status = if matches!(e, OtpError::ProviderUnavailable(_)) {
                    AuditStatus::ProviderUnavailable
                } else {
                    AuditStatus::Denied
                };
                self.journal(Some(user), method, status);
                Err(e.into())
            }
        }
    }

    async fn unlock_with_token(&self, user: &User, method: AccessMethod) -> Result<String, ApiError> {
        self.dispatcher.unlock(user, method).await?;
        self.tokens.issue(&user.id, method).map_err(|e| ApiError::Fatal(e.to_string()))
    }

    /// Acts on a session's terminal result, then marks it consumed.
    async fn follow_up(&self, session: SessionId) {
        let outcome = match self.sessions.wait_terminal(session).await {
            Ok(outcome) => outcome,
            // Reset or superseded before it finished; nothing to act on.
            Err(e) => {
                debug!("[AccessController] {} ended without a result: {}", session, e);
                return;
            }
        };

        let result = match &outcome {
            SessionOutcome::Matched { user } => self.on_match(user).await,
            SessionOutcome::LivenessFailed => {
                warn!("[AccessController] Liveness failed in {}; suspected spoof", session);
                self.journal(None, AccessMethod::Face, AuditStatus::SpoofSuspected);
                AccessResult::Denied { reason: "liveness check failed".into() }
            }
            // Unmatched, registration needed, no face, too small, timeouts and
            // errors never reach the dispatcher.
            other => {
                debug!("[AccessController] {} ended {}; nothing to dispatch", session, other.label());
                AccessResult::NoAction
            }
        };

        {
            // Result and COMPLETE become visible together.
            let mut results = self.results.lock().await;
            // Session ids are sequential, so this keeps the most recent ones.
            results.retain(|id, _| id.0 + RESULT_HISTORY > session.0);
            results.insert(session, result);
            if let Err(e) = self.sessions.consume(session) {
                debug!("[AccessController] {} not consumed: {}", session, e);
            }
        }
        self.handled.notify_waiters();
    }

    async fn on_match(&self, matched: &MatchedUser) -> AccessResult {
        let user = match self.directory.user(&matched.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!("[AccessController] Matched encoding belongs to unknown user {}", matched.user_id);
                self.audit.append(AccessAttempt::new(Some(matched.user_id.clone()), None, AccessMethod::Face, AuditStatus::Denied));
                return AccessResult::Denied { reason: "unknown user".into() };
            }
            Err(e) => return AccessResult::Unavailable { reason: e.to_string(), retryable: true },
        };

        let decision = match self.decide(&user).await {
            Ok(d) => d,
            Err(e) => return AccessResult::Unavailable { reason: e.to_string(), retryable: true },
        };

        match decision {
            AccessDecision::AllowNoOtp => match self.unlock_with_token(&user, AccessMethod::Face).await {
                Ok(token) => AccessResult::Granted { token },
                Err(e) => AccessResult::Unavailable { retryable: e.is_retryable(), reason: e.to_string() },
            },
            AccessDecision::AllowWithOtp => match self.issue_second_factor(&user, AccessMethod::Combined).await {
                Ok(expires_at) => AccessResult::OtpRequired { expires_at },
                Err(e) => AccessResult::Unavailable { retryable: e.is_retryable(), reason: e.to_string() },
            },
            AccessDecision::Deny => {
                self.journal(Some(&user), AccessMethod::Face, AuditStatus::Denied);
                AccessResult::Denied { reason: "access not permitted now".into() }
            }
        }
    }

    async fn verify_otp(&self, phone: &str, code: &str) -> Result<VerifyOtpResponse, ApiError> {
        let digits = normalize_phone(phone)?;
        // Only numbers we sent a code to on behalf of a known user get as far
        // as the provider.
        let pending = self
            .second_factors
            .lock()
            .await
            .get(&digits)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("no pending verification for this phone".into()))?;
        let user = self
            .directory
            .user(&pending.user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("user {}", pending.user_id)))?;

        match self.otp.verify(&digits, code).await {
            Ok(VerifyOutcome::Approved) => {
                // The code is spent whatever happens next.
                self.second_factors.lock().await.remove(&digits);
            }
            Err(OtpError::Mismatch { remaining }) => {
                self.journal(Some(&user), pending.method, AuditStatus::OtpMismatch);
                return Ok(VerifyOtpResponse::denied("code mismatch", Some(remaining)));
            }
            Err(e @ (OtpError::Expired | OtpError::Exhausted | OtpError::NotIssued)) => {
                let status = match e {
                    OtpError::Exhausted => AuditStatus::OtpExhausted,
                    _ => AuditStatus::OtpExpired,
                };
                self.second_factors.lock().await.remove(&digits);
                self.journal(Some(&user), pending.method, status);
                return Ok(VerifyOtpResponse::denied(e.to_string(), Some(0)));
            }
            // Provider trouble: the record and its attempts are untouched, so
            // the caller may simply submit again.
            Err(e) => {
                if e.is_retryable() {
                    self.journal(Some(&user), pending.method, AuditStatus::ProviderUnavailable);
                }
                return Err(e.into());
            }
        }

        // Schedules may have changed while the code was outstanding.
        if self.decide(&user).await? == AccessDecision::Deny {
            self.journal(Some(&user), pending.method, AuditStatus::Denied);
            return Ok(VerifyOtpResponse::denied("access not permitted now", None));
        }

        let token = self.unlock_with_token(&user, pending.method).await?;
        info!("[AccessController] {} admitted via {}", user.id, pending.method);
        Ok(VerifyOtpResponse::approved(token))
    }
}

async fn watch_camera_resets(
    inner: std::sync::Weak<Inner>,
    mut signals: tokio::sync::broadcast::Receiver<crate::session::CameraResetSignal>,
) {
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("[AccessController] Missed {} camera reset signals", n);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else { return };
        warn!(
            "[AccessController] Camera reset requested by {} after {} faults ({})",
            signal.session, signal.consecutive_faults, signal.last_fault
        );
        if let Err(e) = inner.sessions.reset_camera().await {
            error!("[AccessController] Automatic camera reset failed: {}", e);
        }
    }
}

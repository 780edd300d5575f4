// Exclusive camera ownership. Only the active session holds a lease.

use crate::liveness::{CaptureFault, Frame};
use crate::session::types::SessionId;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raw frame acquisition, supplied by the device driver.
#[async_trait]
pub trait CameraSource: Send + Sync {
    async fn capture_frame(&self) -> Result<Frame, CaptureFault>;
    /// Power-cycles / reopens the device after repeated faults.
    async fn reset(&self) -> Result<(), CaptureFault>;
}

pub struct CameraResource {
    source: Arc<dyn CameraSource>,
    held: AtomicBool,
}

impl CameraResource {
    pub fn new(source: Arc<dyn CameraSource>) -> Arc<Self> {
        Arc::new(CameraResource { source, held: AtomicBool::new(false) })
    }

    /// Atomic check-and-set. `None` if another lease is outstanding.
    pub fn try_acquire(self: &Arc<Self>, session: SessionId) -> Option<CameraLease> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        debug!("[Camera] Acquired by {}", session);
        Some(CameraLease { resource: Arc::clone(self), session, released: false })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub async fn reset_device(&self) -> Result<(), CaptureFault> {
        self.source.reset().await
    }
}

/// Held by the session worker for the lifetime of one session.
pub struct CameraLease {
    resource: Arc<CameraResource>,
    session: SessionId,
    released: bool,
}

impl CameraLease {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub async fn capture(&self) -> Result<Frame, CaptureFault> {
        self.resource.source.capture_frame().await
    }

    pub fn release(mut self) {
        self.released = true;
        self.resource.held.store(false, Ordering::Release);
        debug!("[Camera] Released by {}", self.session);
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        if !self.released {
            warn!("[Camera] Lease for {} dropped without explicit release", self.session);
            self.resource.held.store(false, Ordering::Release);
        }
    }
}

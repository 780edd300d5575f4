// Recognition session manager: one in-flight capture cycle per device

pub mod types;
pub mod camera;
pub mod manager;

pub use types::{CameraResetSignal, SessionError, SessionId, SessionOutcome, SessionSnapshot, SessionState};
pub use camera::{CameraLease, CameraResource, CameraSource};
pub use manager::SessionManager;

// Second-factor (one-time code) coordination

pub mod types;
pub mod coordinator;

pub use types::{normalize_phone, OtpError, OtpProvider, OtpRecord, ProviderError, ProviderVerdict, VerifyOutcome};
pub use coordinator::OtpCoordinator;

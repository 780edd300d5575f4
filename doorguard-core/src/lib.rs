// doorguard-core: multi-factor access decisions for a single door edge device.

pub mod clock;
pub mod config;
pub mod data_structures;
pub mod directory;
pub mod token;

// Components, leaves first
pub mod liveness;
pub mod policy;
pub mod otp;
pub mod session;
pub mod network;
pub mod audit;
pub mod dispatch;
pub mod access;

pub mod test_utils; // Shared fixtures for unit and integration tests

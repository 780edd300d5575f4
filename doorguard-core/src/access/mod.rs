// Access flow facade over the recognition, policy, OTP and dispatch components

pub mod api;
pub mod controller;

pub use api::{
    AccessResult, ApiError, CompletedRecognition, EntryRequestResponse, OtpStatus, RecognitionStage,
    RecognitionStatus, StartRecognitionResponse, VerifyOtpRequest, VerifyOtpResponse,
};
pub use controller::{AccessController, Collaborators};

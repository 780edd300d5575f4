// Liveness/match adapter entry point

pub mod types;
pub mod matcher;
pub mod adapter;

// Re-export key types
pub use types::{
    AdapterError, AdapterStage, BoundingBox, CaptureFault, Classification, DistanceFeedback,
    Embedding, FaceDetection, Frame, MatchedUser, Screening,
};
pub use matcher::EmbeddingMatcher;
pub use adapter::{FaceEmbedder, LivenessMatchAdapter, LivenessScorer};

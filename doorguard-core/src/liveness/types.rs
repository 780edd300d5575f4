// Types shared by the capture pipeline and the liveness/match adapter

use crate::data_structures::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One captured camera frame. Pixel layout is owned by the camera driver;
/// the core only passes it through to the embedding and liveness models.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

/// Face location in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn diagonal(&self) -> f64 {
        let (w, h) = (self.width() as f64, self.height() as f64);
        (w * w + h * h).sqrt()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f64>);

impl Embedding {
    /// Euclidean distance, or `None` when the dimensions disagree.
    pub fn distance(&self, other: &Embedding) -> Option<f64> {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return None;
        }
        let sum: f64 = self.0.iter().zip(&other.0).map(|(a, b)| (a - b) * (a - b)).sum();
        Some(sum.sqrt())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFeedback {
    TooFar,
    MuchTooFar,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchedUser {
    pub user_id: UserId,
    pub distance: f64,
    pub confidence: f64,
}

/// Result of the pre-match gates on one capture.
#[derive(Clone, Debug, PartialEq)]
pub enum Screening {
    NoFace,
    FaceTooSmall { feedback: DistanceFeedback, diagonal_px: f64 },
    LivenessFailed { score: f64 },
    Live { detection: FaceDetection, score: f64 },
}

/// The closed set one capture is classified into.
#[derive(Clone, Debug, PartialEq)]
pub enum Classification {
    NoFace,
    FaceTooSmall { feedback: DistanceFeedback },
    LivenessFailed,
    Matched(MatchedUser),
    Unmatched,
    RegistrationNeeded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterStage {
    Capture,
    DetectEmbed,
    Liveness,
    EncodingLoad,
}

impl fmt::Display for AdapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterStage::Capture => "capture",
            AdapterStage::DetectEmbed => "detect/embed",
            AdapterStage::Liveness => "liveness",
            AdapterStage::EncodingLoad => "encoding load",
        };
        f.write_str(s)
    }
}

/// Failure reported by an external capture capability.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CaptureFault {
    #[error("frame dropped")]
    DroppedFrame,
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("model failure: {0}")]
    Model(String),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum AdapterError {
    #[error("{stage} call exceeded {after:?}")]
    Timeout { stage: AdapterStage, after: Duration },
    #[error("{stage} failed: {fault}")]
    Fault { stage: AdapterStage, fault: CaptureFault },
    #[error("encoding store unavailable: {0}")]
    EncodingStore(String),
}

impl AdapterError {
    /// Camera-side hiccups that the session worker retries in place. Model and
    /// store failures are not camera faults and end the session.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Timeout { .. } => true,
            AdapterError::Fault { fault: CaptureFault::DroppedFrame, .. } => true,
            AdapterError::Fault { fault: CaptureFault::DeviceUnavailable(_), .. } => true,
            _ => false,
        }
    }
}

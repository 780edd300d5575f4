// Normalizes the external detect/embed, liveness and encoding-store
// capabilities into the closed `Classification` set.

use crate::config::AdapterThresholds;
use crate::directory::AccessDirectory;
use crate::liveness::matcher::EmbeddingMatcher;
use crate::liveness::types::{
    AdapterError, AdapterStage, BoundingBox, CaptureFault, Classification, DistanceFeedback,
    Embedding, FaceDetection, Frame, Screening,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Face detection + embedding model. `Ok(None)` means no face in frame.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn detect_and_embed(&self, frame: &Frame) -> Result<Option<FaceDetection>, CaptureFault>;
}

/// Anti-spoofing model. Returns a score in [0, 1]; higher means more likely live.
#[async_trait]
pub trait LivenessScorer: Send + Sync {
    async fn score(&self, frame: &Frame, face: &BoundingBox) -> Result<f64, CaptureFault>;
}

pub struct LivenessMatchAdapter {
    embedder: Arc<dyn FaceEmbedder>,
    liveness: Arc<dyn LivenessScorer>,
    directory: Arc<dyn AccessDirectory>,
    thresholds: AdapterThresholds,
    matcher: EmbeddingMatcher,
    call_timeout: Duration,
}

async fn bounded<T>(
    stage: AdapterStage,
    after: Duration,
    call: impl Future<Output = Result<T, CaptureFault>>,
) -> Result<T, AdapterError> {
    match tokio::time::timeout(after, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(AdapterError::Fault { stage, fault }),
        Err(_) => Err(AdapterError::Timeout { stage, after }),
    }
}

impl LivenessMatchAdapter {
    pub fn new(
        embedder: Arc<dyn FaceEmbedder>,
        liveness: Arc<dyn LivenessScorer>,
        directory: Arc<dyn AccessDirectory>,
        thresholds: AdapterThresholds,
        call_timeout: Duration,
    ) -> Self {
        let matcher = EmbeddingMatcher::new(thresholds.match_threshold, thresholds.separation_margin);
        LivenessMatchAdapter { embedder, liveness, directory, thresholds, matcher, call_timeout }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Face-size gate. `None` when the face is large enough.
    pub fn size_feedback(&self, bbox: &BoundingBox) -> Option<DistanceFeedback> {
        let min = self.thresholds.min_face_diagonal_px;
        let diagonal = bbox.diagonal();
        if diagonal >= min {
            None
        } else if diagonal < min * self.thresholds.severe_shortfall_ratio {
            Some(DistanceFeedback::MuchTooFar)
        } else {
            Some(DistanceFeedback::TooFar)
        }
    }

    /// Runs detection, the size gate and the liveness gate. Every external
    /// call is bounded by the per-call timeout.
    pub async fn screen(&self, frame: &Frame) -> Result<Screening, AdapterError> {
        let detection = bounded(AdapterStage::DetectEmbed, self.call_timeout, self.embedder.detect_and_embed(frame)).await?;
        let Some(detection) = detection else {
            debug!("[Adapter] No face in frame {}", frame.sequence);
            return Ok(Screening::NoFace);
        };

        if let Some(feedback) = self.size_feedback(&detection.bbox) {
            let diagonal_px = detection.bbox.diagonal();
            info!(
                "[Adapter] Face too small in frame {} ({:.0}px < {:.0}px): {:?}",
                frame.sequence, diagonal_px, self.thresholds.min_face_diagonal_px, feedback
            );
            return Ok(Screening::FaceTooSmall { feedback, diagonal_px });
        }

        let score = bounded(AdapterStage::Liveness, self.call_timeout, self.liveness.score(frame, &detection.bbox)).await?;
        if score < self.thresholds.liveness_threshold {
            warn!(
                "[Adapter] Liveness check failed for frame {} (score {:.3} < {:.3})",
                frame.sequence, score, self.thresholds.liveness_threshold
            );
            return Ok(Screening::LivenessFailed { score });
        }

        Ok(Screening::Live { detection, score })
    }

    /// Compares a live embedding against the encoding store. Only ever called
    /// after the liveness gate passed.
    pub async fn match_live(&self, embedding: &Embedding) -> Result<Classification, AdapterError> {
        let store = match tokio::time::timeout(self.call_timeout, self.directory.encodings()).await {
            Ok(Ok(store)) => store,
            Ok(Err(e)) => return Err(AdapterError::EncodingStore(e.to_string())),
            Err(_) => return Err(AdapterError::Timeout { stage: AdapterStage::EncodingLoad, after: self.call_timeout }),
        };
        let verdict = self.matcher.classify(embedding, &store);
        match &verdict {
            Classification::Matched(m) => info!("[Adapter] Matched {} (distance {:.3})", m.user_id, m.distance),
            Classification::RegistrationNeeded => info!("[Adapter] Encoding store empty; registration needed"),
            _ => info!("[Adapter] No confident match among {} encodings", store.len()),
        }
        Ok(verdict)
    }

    /// Single-shot classification of one frame.
    pub async fn classify(&self, frame: &Frame) -> Result<Classification, AdapterError> {
        match self.screen(frame).await? {
            Screening::NoFace => Ok(Classification::NoFace),
            Screening::FaceTooSmall { feedback, .. } => Ok(Classification::FaceTooSmall { feedback }),
            Screening::LivenessFailed { .. } => Ok(Classification::LivenessFailed),
            Screening::Live { detection, .. } => self.match_live(&detection.embedding).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;
    use crate::data_structures::UserId;
    use crate::directory::{InMemoryDirectory, StoredEncoding};
    use crate::test_utils::{bbox_with_diagonal, test_frame, ScriptedEmbedder, ScriptedLiveness};

    fn adapter(
        embedder: ScriptedEmbedder,
        liveness: ScriptedLiveness,
        directory: Arc<InMemoryDirectory>,
    ) -> LivenessMatchAdapter {
        let config = AccessConfig::default();
        LivenessMatchAdapter::new(
            Arc::new(embedder),
            Arc::new(liveness),
            directory,
            config.thresholds(),
            config.adapter_call_timeout,
        )
    }

    fn face(diagonal: f64, v: &[f64]) -> FaceDetection {
        FaceDetection { bbox: bbox_with_diagonal(diagonal), embedding: Embedding(v.to_vec()) }
    }

    #[tokio::test]
    async fn forty_percent_short_is_much_too_far() {
        let min = AccessConfig::default().min_face_diagonal_px;
        let a = adapter(
            ScriptedEmbedder::always(Ok(Some(face(min * 0.6, &[0.0])))),
            ScriptedLiveness::always(Ok(1.0)),
            Arc::new(InMemoryDirectory::new()),
        );
        assert_eq!(
            a.classify(&test_frame(1)).await.unwrap(),
            Classification::FaceTooSmall { feedback: DistanceFeedback::MuchTooFar }
        );
    }

    #[tokio::test]
    async fn slightly_short_is_too_far() {
        let min = AccessConfig::default().min_face_diagonal_px;
        let a = adapter(
            ScriptedEmbedder::always(Ok(Some(face(min * 0.9, &[0.0])))),
            ScriptedLiveness::always(Ok(1.0)),
            Arc::new(InMemoryDirectory::new()),
        );
        assert_eq!(
            a.classify(&test_frame(1)).await.unwrap(),
            Classification::FaceTooSmall { feedback: DistanceFeedback::TooFar }
        );
    }

    #[tokio::test]
    async fn spoof_is_never_matched() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.add_encoding(StoredEncoding { encoding_id: 1, user_id: UserId::new("alice"), embedding: Embedding(vec![0.0]) });
        let liveness = ScriptedLiveness::always(Ok(0.1));
        let a = adapter(ScriptedEmbedder::always(Ok(Some(face(200.0, &[0.0])))), liveness, dir.clone());
        assert_eq!(a.classify(&test_frame(1)).await.unwrap(), Classification::LivenessFailed);
    }

    #[tokio::test]
    async fn empty_store_needs_registration() {
        let a = adapter(
            ScriptedEmbedder::always(Ok(Some(face(200.0, &[0.0, 0.1])))),
            ScriptedLiveness::always(Ok(0.9)),
            Arc::new(InMemoryDirectory::new()),
        );
        assert_eq!(a.classify(&test_frame(1)).await.unwrap(), Classification::RegistrationNeeded);
    }

    #[tokio::test]
    async fn no_face_passes_through() {
        let a = adapter(
            ScriptedEmbedder::always(Ok(None)),
            ScriptedLiveness::always(Ok(0.9)),
            Arc::new(InMemoryDirectory::new()),
        );
        assert_eq!(a.classify(&test_frame(1)).await.unwrap(), Classification::NoFace);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_call_times_out() {
        let embedder = ScriptedEmbedder::always(Ok(Some(face(200.0, &[0.0])))).with_delay(Duration::from_secs(6));
        let a = adapter(embedder, ScriptedLiveness::always(Ok(0.9)), Arc::new(InMemoryDirectory::new()));
        let err = a.classify(&test_frame(1)).await.unwrap_err();
        assert_eq!(err, AdapterError::Timeout { stage: AdapterStage::DetectEmbed, after: Duration::from_secs(5) });
        assert!(err.is_transient());
    }
}

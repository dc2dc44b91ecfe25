use aeroface_core::{
    DetectionError, EmbeddingError, LivenessError, MatchError, ValidationError,
};
use aeroface_store::StoreError;
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;

/// Every failure a request can end in.
///
/// Caller faults map to 400, model and infrastructure faults to 5xx.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no face detected in image {image}")]
    NoFace { image: usize },
    #[error("image {image} contains {count} faces; exactly one is required")]
    MultipleFaces { image: usize, count: usize },
    #[error("face detection failed on image {image}: {source}")]
    Detection {
        image: usize,
        #[source]
        source: DetectionError,
    },
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    #[error("possible spoofing attempt (liveness score {liveness_score})")]
    SpoofSuspected { liveness_score: f32 },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("inference engine unavailable")]
    EngineUnavailable,
}

/// Wire form of a failed request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub kind: &'static str,
    pub reason: String,
}

impl ServiceError {
    /// Attach the index of the image being processed to an engine failure.
    pub fn from_engine(image: usize, err: EngineError) -> Self {
        match err {
            EngineError::Detection(source) => ServiceError::Detection { image, source },
            EngineError::Embedding(e) => ServiceError::Embedding(e),
            EngineError::Spawn(_) | EngineError::ChannelClosed => ServiceError::EngineUnavailable,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_)
            | ServiceError::NoFace { .. }
            | ServiceError::MultipleFaces { .. }
            | ServiceError::Liveness(_)
            | ServiceError::SpoofSuspected { .. } => 400,
            ServiceError::Detection { source, .. } => match source {
                DetectionError::Decode(_) => 400,
                _ => 500,
            },
            ServiceError::Embedding(_) | ServiceError::Match(_) | ServiceError::Store(_) => 500,
            ServiceError::EngineUnavailable => 503,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::NoFace { .. }
            | ServiceError::MultipleFaces { .. }
            | ServiceError::Detection { .. } => "detection_error",
            ServiceError::Liveness(_) | ServiceError::SpoofSuspected { .. } => "liveness_error",
            ServiceError::Embedding(_) => "embedding_error",
            ServiceError::Match(_) => "match_error",
            ServiceError::Store(StoreError::DimensionMismatch { .. }) => "embedding_error",
            ServiceError::Store(_) => "storage_error",
            ServiceError::EngineUnavailable => "engine_unavailable",
        }
    }

    /// Whether a verification cycle reports this as a rejected capture
    /// rather than a failed request.
    pub fn is_capture_rejection(&self) -> bool {
        self.status_code() == 400
    }

    /// Human-readable reason reported to the caller.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status_code(),
            kind: self.kind(),
            reason: self.reason(),
        }
    }
}

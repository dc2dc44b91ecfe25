//! aeroface-core — Identity matching, liveness and attendance decisions.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both running
//! via ONNX Runtime for CPU inference. Everything else in this crate is
//! pure and synchronous.

pub mod attendance;
pub mod detector;
pub mod liveness;
pub mod matcher;
pub mod perception;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use attendance::{
    AttendancePolicy, AttendanceSession, SessionError, SessionKey, SessionState, Transition,
};
pub use detector::FaceDetector;
pub use liveness::{LivenessError, LivenessResult};
pub use matcher::{CosineMatcher, MatchError, MatchResult, Matcher};
pub use perception::{DetectedFace, DetectionError, EmbeddingExtractor, FaceDetection};
pub use recognizer::FaceRecognizer;
pub use types::{Embedding, EmbeddingError, EnrolledIdentity, IdentityKey, ValidationError, Venue};

/// Directory searched for `det_10g.onnx` and `w600k_r50.onnx` when no
/// model directory is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/aeroface/models")
}

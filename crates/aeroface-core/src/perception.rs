//! Seams to the perception models.
//!
//! Detection and embedding are model inference: slow and blocking. Both
//! traits take `&mut self` so an implementation can own a non-shareable
//! runtime session; callers run them on a dedicated thread.

use crate::types::{Embedding, EmbeddingError};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("invalid image data: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One face found in an image.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Face sub-image cropped from the source.
    pub crop: RgbImage,
    /// Landmarks normalized to the source image size ([0, 1] on both axes).
    /// Empty when the detector could not place landmarks.
    pub landmarks: Vec<(f32, f32)>,
    pub confidence: f32,
}

/// Locates faces in an encoded image.
pub trait FaceDetection: Send {
    /// Decode `image` and return every face found, sorted by confidence.
    fn detect(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, DetectionError>;
}

/// Turns a face crop into an identity embedding.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, face: &DetectedFace) -> Result<Embedding, EmbeddingError>;

    /// Dimension every embedding from this extractor has.
    fn dim(&self) -> usize;
}

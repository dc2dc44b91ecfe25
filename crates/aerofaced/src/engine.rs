use aeroface_core::{
    DetectedFace, DetectionError, Embedding, EmbeddingError, EmbeddingExtractor, FaceDetection,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detection error: {0}")]
    Detection(#[from] DetectionError),
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<DetectedFace>, DetectionError>>,
    },
    Embed {
        face: DetectedFace,
        reply: oneshot::Sender<Result<Embedding, EmbeddingError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    embedding_dim: usize,
}

impl EngineHandle {
    /// Decode one image and return every face in it, most confident first.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Vec<DetectedFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Extract the identity embedding of one detected face.
    pub async fn embed(&self, face: DetectedFace) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed { face, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Dimension of every embedding this engine produces.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns both models and serves requests one at a time; the
/// ONNX sessions are never shared across threads.
pub fn spawn_engine(
    mut detector: Box<dyn FaceDetection>,
    mut extractor: Box<dyn EmbeddingExtractor>,
) -> Result<EngineHandle, EngineError> {
    let embedding_dim = extractor.dim();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("aeroface-engine".into())
        .spawn(move || {
            tracing::info!(embedding_dim, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { image, reply } => {
                        let result = detector.detect(&image);
                        if let Ok(faces) = &result {
                            tracing::debug!(faces = faces.len(), bytes = image.len(), "detect");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Embed { face, reply } => {
                        let _ = reply.send(extractor.extract(&face));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, embedding_dim })
}

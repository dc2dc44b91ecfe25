use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid embedding vector: {0}")]
    InvalidVector(String),
}

impl From<ort::Error> for EmbeddingError {
    fn from(err: ort::Error) -> Self {
        EmbeddingError::InferenceFailed(format!("ort: {err}"))
    }
}

/// Malformed input rejected before any collaborator runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid identity token '{0}' (expected UUID or email)")]
    InvalidIdentityToken(String),
    #[error("venue identifier must not be empty")]
    EmptyVenue,
    #[error("expected between {min} and {max} images, got {count}")]
    ImageCount { count: usize, min: usize, max: usize },
    #[error("invalid file type: {0}")]
    UnsupportedFileType(String),
}

/// L2-normalized face embedding.
///
/// Values are private: an embedding never changes after construction, so
/// a reader can never observe a partially replaced vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    model_version: Option<String>,
}

impl Embedding {
    /// Build an embedding from raw model output, normalizing to unit length.
    ///
    /// Rejects empty, non-finite and all-zero vectors: none of them can be
    /// compared by cosine similarity.
    pub fn new(raw: Vec<f32>, model_version: Option<String>) -> Result<Self, EmbeddingError> {
        if raw.is_empty() {
            return Err(EmbeddingError::InvalidVector("empty vector".into()));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidVector("non-finite component".into()));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(EmbeddingError::InvalidVector("zero norm".into()));
        }

        Ok(Self {
            values: raw.iter().map(|x| x / norm).collect(),
            model_version,
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Little-endian f32 encoding used for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(
        bytes: &[u8],
        model_version: Option<String>,
    ) -> Result<Self, EmbeddingError> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::InvalidVector(format!(
                "byte length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let raw = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(raw, model_version)
    }
}

/// Lookup key for an identity: its id or its unique email.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Id(Uuid),
    Email(String),
}

impl IdentityKey {
    /// Parse an identity token. Tokens containing `@` are emails; anything
    /// else must be a UUID.
    pub fn parse(token: &str) -> Result<Self, ValidationError> {
        let token = token.trim();
        if token.contains('@') {
            let valid = token
                .split_once('@')
                .map(|(local, domain)| {
                    !local.is_empty()
                        && domain.contains('.')
                        && !domain.starts_with('.')
                        && !domain.ends_with('.')
                        && !domain.contains('@')
                })
                .unwrap_or(false);
            if valid && !token.chars().any(char::is_whitespace) {
                return Ok(IdentityKey::Email(token.to_ascii_lowercase()));
            }
            return Err(ValidationError::InvalidIdentityToken(token.to_string()));
        }

        Uuid::parse_str(token)
            .map(IdentityKey::Id)
            .map_err(|_| ValidationError::InvalidIdentityToken(token.to_string()))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Id(id) => write!(f, "{id}"),
            IdentityKey::Email(email) => f.write_str(email),
        }
    }
}

/// Opaque venue identifier for attendance grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Venue(String);

impl Venue {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyVenue);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An identity together with its active embedding.
#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    pub id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub embedding: Embedding,
}

impl EnrolledIdentity {
    /// Name shown on an accept overlay: display name, then email, then id.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

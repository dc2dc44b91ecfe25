//! Cosine similarity matching and gallery identification.

use crate::types::{Embedding, EnrolledIdentity};
use thiserror::Error;
use uuid::Uuid;

/// Default acceptance threshold for a positive identification.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    /// Stored and query embeddings come from different models; the
    /// gallery entry needs re-enrollment.
    #[error("embedding dimension mismatch: query has {query}, candidate has {candidate}")]
    DimensionMismatch { query: usize, candidate: usize },
    #[error("no candidates to match against")]
    NoMatch,
}

/// Cosine similarity in [-1, 1]. Higher = more similar.
///
/// Always processes all dimensions; there is no early exit.
pub fn similarity(a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
    if a.dim() != b.dim() {
        return Err(MatchError::DimensionMismatch {
            query: a.dim(),
            candidate: b.dim(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.values().iter().zip(b.values()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    let score = if denom > 0.0 { dot / denom } else { 0.0 };
    Ok(score.clamp(-1.0, 1.0))
}

/// Pick the candidate most similar to `query`.
///
/// Ties go to the earliest candidate. Every candidate is scored, so a
/// dimension mismatch anywhere in the slice is reported even when a
/// perfect match appears first.
pub fn best_match<'a, T, F>(
    query: &Embedding,
    candidates: &'a [T],
    embedding_of: F,
) -> Result<(&'a T, f32), MatchError>
where
    F: Fn(&T) -> &Embedding,
{
    let mut best: Option<(&'a T, f32)> = None;

    for candidate in candidates {
        let score = similarity(query, embedding_of(candidate))?;
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }

    best.ok_or(MatchError::NoMatch)
}

/// Result of matching a query embedding against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, set only when the similarity cleared the threshold.
    pub identity_id: Option<Uuid>,
    /// Label of the matched identity (if any).
    pub label: Option<String>,
    /// Cosine similarity of the best candidate [-1, 1]; 0.0 for an empty gallery.
    pub similarity: f32,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }

    fn no_match(similarity: f32) -> Self {
        Self {
            identity_id: None,
            label: None,
            similarity,
        }
    }
}

/// Strategy for identifying a query embedding against the enrolled gallery.
///
/// The default is a linear scan; an indexed implementation can replace it
/// without touching callers.
pub trait Matcher: Send + Sync {
    fn identify(
        &self,
        query: &Embedding,
        gallery: &[EnrolledIdentity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// O(N) cosine scan over every gallery entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn identify(
        &self,
        query: &Embedding,
        gallery: &[EnrolledIdentity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let (best, score) = match best_match(query, gallery, |g| &g.embedding) {
            Ok(found) => found,
            Err(MatchError::NoMatch) => return Ok(MatchResult::no_match(0.0)),
            Err(e) => return Err(e),
        };

        if score >= threshold {
            Ok(MatchResult {
                identity_id: Some(best.id),
                label: Some(best.label()),
                similarity: score,
            })
        } else {
            tracing::debug!(
                best = %best.id,
                similarity = score,
                threshold,
                "best candidate below threshold"
            );
            Ok(MatchResult::no_match(score))
        }
    }
}

//! Movement-based liveness classification.
//!
//! A printed photo or a replayed still produces the same face position in
//! every frame of a submission. Each frame is reduced to the mean of its
//! normalized landmark coordinates, and the mean displacement between
//! consecutive centers must exceed a threshold.
//!
//! The check fails closed: a single frame can never prove liveness.

use serde::Serialize;
use thiserror::Error;

/// Default minimum mean displacement, in normalized image units.
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.015;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LivenessError {
    #[error("face landmarks not detected in image {index}")]
    NoFaceLandmarks { index: usize },
}

/// Face center in normalized image space ([0, 1] on both axes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceCenter {
    pub x: f32,
    pub y: f32,
}

impl FaceCenter {
    /// Mean of the landmark coordinates. `None` when there are no landmarks.
    pub fn from_landmarks(landmarks: &[(f32, f32)]) -> Option<Self> {
        if landmarks.is_empty() {
            return None;
        }
        let n = landmarks.len() as f32;
        let (sx, sy) = landmarks
            .iter()
            .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
        Some(Self { x: sx / n, y: sy / n })
    }

    fn distance(&self, other: &FaceCenter) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Result of a liveness check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessResult {
    pub is_live: bool,
    /// Mean displacement rounded to 4 decimals; 0.0 when fewer than 2 frames.
    pub liveness_score: f32,
    /// Number of consecutive frame pairs analysed.
    pub frame_pairs_analysed: usize,
}

/// Classify a sequence of face centers.
pub fn classify(centers: &[FaceCenter], threshold: f32) -> LivenessResult {
    if centers.len() < 2 {
        return LivenessResult {
            is_live: false,
            liveness_score: 0.0,
            frame_pairs_analysed: 0,
        };
    }

    let pairs = centers.len() - 1;
    let total: f32 = centers.windows(2).map(|w| w[0].distance(&w[1])).sum();
    let avg_movement = total / pairs as f32;

    LivenessResult {
        is_live: avg_movement > threshold,
        liveness_score: round4(avg_movement),
        frame_pairs_analysed: pairs,
    }
}

/// Check liveness from per-image landmark sets, in capture order.
pub fn check_liveness<L>(
    landmark_sets: &[L],
    threshold: f32,
) -> Result<LivenessResult, LivenessError>
where
    L: AsRef<[(f32, f32)]>,
{
    let centers = landmark_sets
        .iter()
        .enumerate()
        .map(|(index, lms)| {
            FaceCenter::from_landmarks(lms.as_ref()).ok_or(LivenessError::NoFaceLandmarks { index })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let result = classify(&centers, threshold);
    tracing::debug!(
        frames = centers.len(),
        score = result.liveness_score,
        is_live = result.is_live,
        "liveness classified"
    );
    Ok(result)
}

fn round4(v: f32) -> f32 {
    ((v as f64 * 10_000.0).round() / 10_000.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_at(cx: f32, cy: f32) -> Vec<(f32, f32)> {
        // Symmetric five-point layout around (cx, cy)
        vec![
            (cx - 0.05, cy - 0.04),
            (cx + 0.05, cy - 0.04),
            (cx, cy),
            (cx - 0.04, cy + 0.04),
            (cx + 0.04, cy + 0.04),
        ]
    }

    #[test]
    fn test_center_is_landmark_mean() {
        let c = FaceCenter::from_landmarks(&face_at(0.4, 0.6)).unwrap();
        assert!((c.x - 0.4).abs() < 1e-6);
        assert!((c.y - 0.6).abs() < 1e-6);
        assert!(FaceCenter::from_landmarks(&[]).is_none());
    }

    #[test]
    fn test_single_frame_fails_closed() {
        let result = check_liveness(&[face_at(0.5, 0.5)], DEFAULT_LIVENESS_THRESHOLD).unwrap();
        assert!(!result.is_live);
        assert_eq!(result.frame_pairs_analysed, 0);
        assert_eq!(result.liveness_score, 0.0);
    }

    #[test]
    fn test_empty_sequence_fails_closed() {
        let sets: Vec<Vec<(f32, f32)>> = vec![];
        assert!(!check_liveness(&sets, DEFAULT_LIVENESS_THRESHOLD).unwrap().is_live);
    }

    #[test]
    fn test_identical_frames_rejected() {
        let f = face_at(0.5, 0.5);
        let result = check_liveness(&[f.clone(), f], DEFAULT_LIVENESS_THRESHOLD).unwrap();
        assert!(!result.is_live);
        assert_eq!(result.liveness_score, 0.0);
        assert_eq!(result.frame_pairs_analysed, 1);
    }

    #[test]
    fn test_movement_above_threshold_is_live() {
        let result = check_liveness(
            &[face_at(0.50, 0.50), face_at(0.52, 0.50)],
            DEFAULT_LIVENESS_THRESHOLD,
        )
        .unwrap();
        assert!(result.is_live);
        assert!((result.liveness_score - 0.02).abs() < 1e-4);
    }

    #[test]
    fn test_movement_below_threshold_is_spoof() {
        let result = check_liveness(
            &[face_at(0.50, 0.50), face_at(0.505, 0.50)],
            DEFAULT_LIVENESS_THRESHOLD,
        )
        .unwrap();
        assert!(!result.is_live);
    }

    #[test]
    fn test_mean_across_pairs() {
        // Pair 1 moves 0.03 (3-4-5 triangle scaled), pair 2 does not move: mean 0.015
        let centers = [
            FaceCenter { x: 0.5, y: 0.5 },
            FaceCenter { x: 0.518, y: 0.524 },
            FaceCenter { x: 0.518, y: 0.524 },
        ];
        let result = classify(&centers, DEFAULT_LIVENESS_THRESHOLD);
        assert_eq!(result.frame_pairs_analysed, 2);
        assert!((result.liveness_score - 0.015).abs() < 1e-4);
    }

    #[test]
    fn test_score_rounded_to_four_decimals() {
        let centers = [FaceCenter { x: 0.0, y: 0.0 }, FaceCenter { x: 0.123456, y: 0.0 }];
        let result = classify(&centers, DEFAULT_LIVENESS_THRESHOLD);
        assert!((result.liveness_score - 0.1235).abs() < 1e-6);
    }

    #[test]
    fn test_missing_landmarks_names_the_image() {
        let sets = vec![face_at(0.5, 0.5), vec![], face_at(0.6, 0.5)];
        assert_eq!(
            check_liveness(&sets, DEFAULT_LIVENESS_THRESHOLD),
            Err(LivenessError::NoFaceLandmarks { index: 1 })
        );
    }

    #[test]
    fn test_deterministic() {
        let sets = vec![face_at(0.3, 0.3), face_at(0.35, 0.32), face_at(0.31, 0.29)];
        let a = check_liveness(&sets, DEFAULT_LIVENESS_THRESHOLD).unwrap();
        let b = check_liveness(&sets, DEFAULT_LIVENESS_THRESHOLD).unwrap();
        assert_eq!(a, b);
    }
}

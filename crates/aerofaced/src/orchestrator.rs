//! Enrollment and verification pipelines.
//!
//! Validation runs before any model call. Detection and embedding go
//! through the engine thread; liveness and matching are computed inline.
//! A failure at any step leaves the store untouched.

use aeroface_core::attendance::{AttendancePolicy, AttendanceSession, SessionKey};
use aeroface_core::liveness::{check_liveness, LivenessResult};
use aeroface_core::{DetectedFace, IdentityKey, Matcher, ValidationError, Venue};
use aeroface_store::{FaceStore, IdentityRecord};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::ServiceError;
use crate::keyed::KeyedLocks;
use crate::tracker::{AttendanceTracker, AttendanceUpdate};

pub const MIN_ENROLL_IMAGES: usize = 1;
pub const MAX_ENROLL_IMAGES: usize = 5;
pub const MAX_WINDOW_FRAMES: usize = 10;
const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Decision thresholds and timing.
#[derive(Debug, Clone)]
pub struct Settings {
    pub similarity_threshold: f32,
    pub liveness_threshold: f32,
    pub check_interval: TimeDelta,
    pub policy: AttendancePolicy,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            liveness_threshold: config.liveness_threshold,
            check_interval: config.check_interval,
            policy: config.policy(),
        }
    }
}

/// One uploaded enrollment image.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollReport {
    pub status: &'static str,
    pub identity_id: Uuid,
    pub faces_detected: usize,
    pub liveness_score: f32,
    pub embedding_dim: usize,
}

/// Outcome of one verification cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Granted {
        identity_id: Uuid,
        label: String,
        similarity: f32,
        liveness_score: f32,
        attendance: AttendanceUpdate,
    },
    Denied {
        similarity: f32,
        liveness_score: f32,
    },
    Rejected {
        kind: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub venue: Venue,
    pub computed_at: DateTime<Utc>,
    /// False when served from the per-venue cache.
    pub fresh: bool,
    #[serde(flatten)]
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub enrolled: usize,
    pub identities: usize,
    pub embedding_dim: usize,
    pub similarity_threshold: f32,
    pub liveness_threshold: f32,
    pub dwell_secs: i64,
    pub check_interval_ms: i64,
    pub reentry_cooldown_secs: Option<i64>,
}

pub struct Orchestrator {
    engine: EngineHandle,
    store: Arc<FaceStore>,
    matcher: Box<dyn Matcher>,
    tracker: AttendanceTracker,
    settings: Settings,
    /// Last report per venue. Never evicted; venues are a small fixed set.
    decisions: KeyedLocks<Venue, Option<VerificationReport>>,
}

impl Orchestrator {
    pub fn new(
        engine: EngineHandle,
        store: Arc<FaceStore>,
        matcher: Box<dyn Matcher>,
        settings: Settings,
    ) -> Self {
        let tracker = AttendanceTracker::new(store.clone(), settings.policy);
        Self {
            engine,
            store,
            matcher,
            tracker,
            settings,
            decisions: KeyedLocks::new(),
        }
    }

    /// Register (or replace) the face of the identity named by `user_key`.
    pub async fn enroll(
        &self,
        user_key: &str,
        display_name: Option<String>,
        images: Vec<UploadedImage>,
    ) -> Result<EnrollReport, ServiceError> {
        let key = IdentityKey::parse(user_key)?;
        validate_uploads(&images)?;

        let mut faces = Vec::with_capacity(images.len());
        for (index, image) in images.into_iter().enumerate() {
            let found = self
                .engine
                .detect(image.bytes)
                .await
                .map_err(|e| ServiceError::from_engine(index, e))?;
            faces.push(exactly_one_face(index, found)?);
        }

        let liveness = self.ensure_live(&faces)?;
        let faces_detected = faces.len();

        let first = faces.into_iter().next().ok_or(ValidationError::ImageCount {
            count: 0,
            min: MIN_ENROLL_IMAGES,
            max: MAX_ENROLL_IMAGES,
        })?;
        let embedding = self
            .engine
            .embed(first)
            .await
            .map_err(|e| ServiceError::from_engine(0, e))?;

        let identity_id = self.store.set_embedding(&key, display_name, &embedding).await?;
        tracing::info!(
            identity = %identity_id,
            key = %key,
            faces = faces_detected,
            liveness_score = liveness.liveness_score,
            "face registered"
        );

        Ok(EnrollReport {
            status: "face_registered",
            identity_id,
            faces_detected,
            liveness_score: liveness.liveness_score,
            embedding_dim: embedding.dim(),
        })
    }

    /// Run one verification cycle for `venue` over a capture window.
    ///
    /// Within `check_interval` of the previous cycle at the same venue the
    /// cached decision is returned and `frames` are ignored.
    pub async fn verify(
        &self,
        venue: &Venue,
        frames: Vec<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<VerificationReport, ServiceError> {
        if frames.is_empty() || frames.len() > MAX_WINDOW_FRAMES {
            return Err(ValidationError::ImageCount {
                count: frames.len(),
                min: 1,
                max: MAX_WINDOW_FRAMES,
            }
            .into());
        }

        let mut cached = self.decisions.lock(venue).await;
        if let Some(previous) = cached.as_ref() {
            if now - previous.computed_at < self.settings.check_interval {
                return Ok(VerificationReport {
                    fresh: false,
                    ..previous.clone()
                });
            }
        }

        let decision = match self.run_cycle(venue, frames, now).await {
            Ok(decision) => decision,
            Err(e) if e.is_capture_rejection() => {
                tracing::warn!(venue = %venue, kind = e.kind(), reason = %e, "capture rejected");
                Decision::Rejected {
                    kind: e.kind(),
                    reason: e.reason(),
                }
            }
            Err(e) => return Err(e),
        };

        let report = VerificationReport {
            venue: venue.clone(),
            computed_at: now,
            fresh: true,
            decision,
        };
        *cached = Some(report.clone());
        Ok(report)
    }

    pub async fn identities(&self) -> Result<Vec<IdentityRecord>, ServiceError> {
        Ok(self.store.list_identities().await?)
    }

    pub async fn attendance_log(
        &self,
        venue: Option<&Venue>,
    ) -> Result<Vec<AttendanceSession>, ServiceError> {
        Ok(self.store.sessions(venue).await?)
    }

    pub async fn status(&self) -> Result<StatusReport, ServiceError> {
        let identities = self.store.list_identities().await?;
        let policy = self.tracker.policy();
        Ok(StatusReport {
            enrolled: identities.iter().filter(|r| r.embedding_dim.is_some()).count(),
            identities: identities.len(),
            embedding_dim: self.engine.embedding_dim(),
            similarity_threshold: self.settings.similarity_threshold,
            liveness_threshold: self.settings.liveness_threshold,
            dwell_secs: policy.dwell_min.num_seconds(),
            check_interval_ms: self.settings.check_interval.num_milliseconds(),
            reentry_cooldown_secs: policy.reentry_cooldown.map(|c| c.num_seconds()),
        })
    }

    async fn run_cycle(
        &self,
        venue: &Venue,
        frames: Vec<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<Decision, ServiceError> {
        let mut faces = Vec::with_capacity(frames.len());
        for (index, frame) in frames.into_iter().enumerate() {
            let found = self
                .engine
                .detect(frame)
                .await
                .map_err(|e| ServiceError::from_engine(index, e))?;
            // Most confident face; others in view are ignored.
            let face = found.into_iter().next().ok_or(ServiceError::NoFace { image: index })?;
            faces.push(face);
        }

        let liveness = self.ensure_live(&faces)?;

        let last = faces.len() - 1;
        let query_face = faces.swap_remove(last);
        let query = self
            .engine
            .embed(query_face)
            .await
            .map_err(|e| ServiceError::from_engine(last, e))?;

        let gallery = self.store.enrolled().await?;
        let result = self
            .matcher
            .identify(&query, &gallery, self.settings.similarity_threshold)?;

        let (Some(identity_id), Some(label)) = (result.identity_id, result.label) else {
            tracing::info!(venue = %venue, similarity = result.similarity, "access denied");
            return Ok(Decision::Denied {
                similarity: result.similarity,
                liveness_score: liveness.liveness_score,
            });
        };

        tracing::info!(
            venue = %venue,
            identity = %identity_id,
            similarity = result.similarity,
            "access granted"
        );
        let key = SessionKey {
            identity_id,
            venue: venue.clone(),
        };
        let attendance = self.tracker.record_identification(&key, now).await?;

        Ok(Decision::Granted {
            identity_id,
            label,
            similarity: result.similarity,
            liveness_score: liveness.liveness_score,
            attendance,
        })
    }

    fn ensure_live(&self, faces: &[DetectedFace]) -> Result<LivenessResult, ServiceError> {
        let landmarks: Vec<&[(f32, f32)]> = faces.iter().map(|f| f.landmarks.as_slice()).collect();
        let liveness = check_liveness(&landmarks, self.settings.liveness_threshold)?;
        if !liveness.is_live {
            tracing::warn!(
                liveness_score = liveness.liveness_score,
                frames = faces.len(),
                "possible spoofing attempt"
            );
            return Err(ServiceError::SpoofSuspected {
                liveness_score: liveness.liveness_score,
            });
        }
        Ok(liveness)
    }
}

fn validate_uploads(images: &[UploadedImage]) -> Result<(), ValidationError> {
    if !(MIN_ENROLL_IMAGES..=MAX_ENROLL_IMAGES).contains(&images.len()) {
        return Err(ValidationError::ImageCount {
            count: images.len(),
            min: MIN_ENROLL_IMAGES,
            max: MAX_ENROLL_IMAGES,
        });
    }
    for image in images {
        let allowed = Path::new(&image.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if !allowed {
            return Err(ValidationError::UnsupportedFileType(image.name.clone()));
        }
    }
    Ok(())
}

fn exactly_one_face(
    image: usize,
    mut found: Vec<DetectedFace>,
) -> Result<DetectedFace, ServiceError> {
    match found.len() {
        0 => Err(ServiceError::NoFace { image }),
        1 => Ok(found.remove(0)),
        count => Err(ServiceError::MultipleFaces { image, count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::tracker::AttendanceEvent;
    use aeroface_core::attendance::SessionState;
    use aeroface_core::{
        CosineMatcher, DetectionError, Embedding, EmbeddingError, EmbeddingExtractor,
        FaceDetection, MatchError,
    };
    use aeroface_store::StoreError;
    use chrono::TimeZone;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test images are `[face_count, x_percent, person]`.
    fn frame(person: u8, x_percent: u8) -> Vec<u8> {
        vec![1, x_percent, person]
    }

    fn upload(name: &str, bytes: Vec<u8>) -> UploadedImage {
        UploadedImage {
            name: name.to_string(),
            bytes,
        }
    }

    struct ScriptedDetector {
        calls: Arc<AtomicUsize>,
    }

    impl FaceDetection for ScriptedDetector {
        fn detect(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, DetectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let [count, x, person] = image else {
                return Err(DetectionError::InferenceFailed("unexpected test image".into()));
            };
            let x = *x as f32 / 100.0;
            Ok((0..*count)
                .map(|_| DetectedFace {
                    crop: RgbImage::from_pixel(2, 2, Rgb([*person, 0, 0])),
                    landmarks: vec![(x, 0.5); 5],
                    confidence: 0.9,
                })
                .collect())
        }
    }

    /// One-hot embedding on the person id encoded in the crop.
    struct OneHotExtractor {
        dim: usize,
    }

    impl EmbeddingExtractor for OneHotExtractor {
        fn extract(&mut self, face: &DetectedFace) -> Result<Embedding, EmbeddingError> {
            let person = face.crop.get_pixel(0, 0)[0] as usize;
            let mut values = vec![0.0; self.dim];
            values[person % self.dim] = 1.0;
            Embedding::new(values, Some("one-hot".into()))
        }

        fn dim(&self) -> usize {
            self.dim
        }
    }

    fn t(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
    }

    fn settings() -> Settings {
        Settings {
            similarity_threshold: 0.7,
            liveness_threshold: 0.015,
            check_interval: TimeDelta::milliseconds(1000),
            policy: AttendancePolicy::default(),
        }
    }

    async fn harness(dim: usize) -> (Orchestrator, Arc<FaceStore>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = spawn_engine(
            Box::new(ScriptedDetector { calls: calls.clone() }),
            Box::new(OneHotExtractor { dim }),
        )
        .unwrap();
        let store = Arc::new(FaceStore::open_in_memory(None).await.unwrap());
        let orchestrator =
            Orchestrator::new(engine, store.clone(), Box::new(CosineMatcher), settings());
        (orchestrator, store, calls)
    }

    fn lounge() -> Venue {
        Venue::new("lounge-a").unwrap()
    }

    #[tokio::test]
    async fn enroll_registers_face() {
        let (orch, store, calls) = harness(3).await;
        let report = orch
            .enroll(
                "ana@example.com",
                Some("Ana".into()),
                vec![upload("a.jpg", frame(1, 40)), upload("b.PNG", frame(1, 45))],
            )
            .await
            .unwrap();

        assert_eq!(report.status, "face_registered");
        assert_eq!(report.faces_detected, 2);
        assert_eq!(report.embedding_dim, 3);
        assert!((report.liveness_score - 0.05).abs() < 1e-4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stored = store
            .get_embedding(&IdentityKey::Id(report.identity_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.values(), &[0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn six_images_rejected_before_detection() {
        let (orch, _store, calls) = harness(3).await;
        let images: Vec<_> = (0..6)
            .map(|i| upload(&format!("{i}.jpg"), frame(1, i * 10)))
            .collect();

        let err = orch.enroll("ana@example.com", None, images).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::ImageCount { count: 6, .. })
        ));
        assert_eq!(err.status_code(), 400);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bad_token_and_file_type_rejected_before_detection() {
        let (orch, _store, calls) = harness(3).await;

        let err = orch
            .enroll("not-a-key", None, vec![upload("a.jpg", frame(1, 10))])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::InvalidIdentityToken(_))));

        let err = orch
            .enroll("ana@example.com", None, vec![upload("a.gif", frame(1, 10))])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::UnsupportedFileType(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn two_face_image_fails_and_stores_nothing() {
        let (orch, store, _calls) = harness(3).await;
        let err = orch
            .enroll(
                "ana@example.com",
                None,
                vec![upload("a.jpg", frame(1, 10)), upload("b.jpg", vec![2, 20, 1])],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::MultipleFaces { image: 1, count: 2 }));
        assert!(store.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_images_are_spoofs_and_store_nothing() {
        let (orch, store, _calls) = harness(3).await;
        let err = orch
            .enroll(
                "ana@example.com",
                None,
                vec![upload("a.jpg", frame(1, 30)), upload("b.jpg", frame(1, 30))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SpoofSuspected { .. }));

        // A single image never proves liveness.
        let err = orch
            .enroll("ana@example.com", None, vec![upload("a.jpg", frame(1, 30))])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SpoofSuspected { .. }));
        assert!(store.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verify_checks_in_holds_then_checks_out() {
        let (orch, _store, _calls) = harness(3).await;
        let enrolled = orch
            .enroll(
                "ana@example.com",
                Some("Ana".into()),
                vec![upload("a.jpg", frame(1, 10)), upload("b.jpg", frame(1, 20))],
            )
            .await
            .unwrap();
        let window = || vec![frame(1, 50), frame(1, 53)];

        let first = orch.verify(&lounge(), window(), t(0)).await.unwrap();
        let Decision::Granted { identity_id, label, attendance, .. } = &first.decision else {
            panic!("expected grant, got {:?}", first.decision);
        };
        assert_eq!(*identity_id, enrolled.identity_id);
        assert_eq!(label, "Ana");
        assert_eq!(attendance.event, Some(AttendanceEvent::CheckedIn));

        let second = orch.verify(&lounge(), window(), t(1_500)).await.unwrap();
        let Decision::Granted { attendance, .. } = &second.decision else {
            panic!("expected grant");
        };
        assert_eq!(attendance.event, None);
        assert_eq!(attendance.state, SessionState::CheckedIn);

        let third = orch.verify(&lounge(), window(), t(12_000)).await.unwrap();
        let Decision::Granted { attendance, .. } = &third.decision else {
            panic!("expected grant");
        };
        assert_eq!(attendance.event, Some(AttendanceEvent::CheckedOut));
        assert_eq!(
            attendance.session.as_ref().and_then(|s| s.checkout_time),
            Some(t(12_000))
        );

        let log = orch.attendance_log(Some(&lounge())).await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn verify_within_interval_returns_cached_decision() {
        let (orch, _store, calls) = harness(3).await;
        orch.enroll(
            "ana@example.com",
            None,
            vec![upload("a.jpg", frame(1, 10)), upload("b.jpg", frame(1, 20))],
        )
        .await
        .unwrap();
        let before = calls.load(Ordering::SeqCst);

        let first = orch
            .verify(&lounge(), vec![frame(1, 50), frame(1, 53)], t(0))
            .await
            .unwrap();
        assert!(first.fresh);
        assert_eq!(calls.load(Ordering::SeqCst), before + 2);

        // No face in these frames, but the cycle is throttled.
        let cached = orch
            .verify(&lounge(), vec![vec![0, 0, 0], vec![0, 0, 0]], t(400))
            .await
            .unwrap();
        assert!(!cached.fresh);
        assert_eq!(cached.computed_at, t(0));
        assert!(matches!(cached.decision, Decision::Granted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), before + 2);

        // Other venues are not throttled by this one.
        let other = Venue::new("lounge-b").unwrap();
        let elsewhere = orch
            .verify(&other, vec![vec![0, 0, 0]], t(400))
            .await
            .unwrap();
        assert!(elsewhere.fresh);
        assert!(matches!(
            elsewhere.decision,
            Decision::Rejected { kind: "detection_error", .. }
        ));
    }

    #[tokio::test]
    async fn unknown_face_is_denied() {
        let (orch, _store, _calls) = harness(3).await;
        orch.enroll(
            "ana@example.com",
            None,
            vec![upload("a.jpg", frame(1, 10)), upload("b.jpg", frame(1, 20))],
        )
        .await
        .unwrap();

        let report = orch
            .verify(&lounge(), vec![frame(2, 50), frame(2, 55)], t(0))
            .await
            .unwrap();
        assert!(matches!(
            report.decision,
            Decision::Denied { similarity, .. } if similarity.abs() < 1e-6
        ));
        assert!(orch.attendance_log(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_window_is_rejected_not_granted() {
        let (orch, _store, _calls) = harness(3).await;
        let report = orch
            .verify(&lounge(), vec![frame(1, 50), frame(1, 50)], t(0))
            .await
            .unwrap();
        assert!(matches!(
            report.decision,
            Decision::Rejected { kind: "liveness_error", .. }
        ));
    }

    #[tokio::test]
    async fn query_dimension_mismatch_is_an_error() {
        let (orch, store, _calls) = harness(3).await;
        let legacy = Embedding::new(vec![1.0, 0.0], None).unwrap();
        store
            .set_embedding(&IdentityKey::parse("old@example.com").unwrap(), None, &legacy)
            .await
            .unwrap();

        let err = orch
            .verify(&lounge(), vec![frame(1, 50), frame(1, 55)], t(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Match(MatchError::DimensionMismatch { query: 3, candidate: 2 })
        ));
    }

    #[tokio::test]
    async fn enrolling_into_a_different_dimension_is_an_embedding_error() {
        let (orch, store, _calls) = harness(3).await;
        let legacy = Embedding::new(vec![1.0, 0.0], None).unwrap();
        store
            .set_embedding(&IdentityKey::parse("old@example.com").unwrap(), None, &legacy)
            .await
            .unwrap();

        let err = orch
            .enroll(
                "ana@example.com",
                None,
                vec![upload("a.jpg", frame(1, 10)), upload("b.jpg", frame(1, 20))],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Store(StoreError::DimensionMismatch { stored: 2, actual: 3 })
        ));
        assert_eq!(err.body().kind, "embedding_error");
        assert_eq!(err.body().status, 500);
    }

    #[tokio::test]
    async fn empty_window_is_a_validation_error() {
        let (orch, _store, calls) = harness(3).await;
        let err = orch.verify(&lounge(), Vec::new(), t(0)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_reports_counts_and_thresholds() {
        let (orch, _store, _calls) = harness(3).await;
        orch.enroll(
            "ana@example.com",
            None,
            vec![upload("a.jpg", frame(1, 10)), upload("b.jpg", frame(1, 20))],
        )
        .await
        .unwrap();

        let status = orch.status().await.unwrap();
        assert_eq!(status.enrolled, 1);
        assert_eq!(status.embedding_dim, 3);
        assert_eq!(status.dwell_secs, 10);
        assert_eq!(status.reentry_cooldown_secs, None);
    }
}

use aeroface_core::Venue;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

use crate::error::ServiceError;
use crate::orchestrator::{Orchestrator, UploadedImage};

pub const BUS_NAME: &str = "org.aeroface.Attendance1";
pub const OBJECT_PATH: &str = "/org/aeroface/Attendance1";

/// D-Bus interface for the AeroFace attendance daemon.
///
/// Bus name: org.aeroface.Attendance1
/// Object path: /org/aeroface/Attendance1
///
/// Every method returns JSON. Failures carry a JSON body
/// `{status, kind, reason}` as the error message.
pub struct AttendanceService {
    orchestrator: Arc<Orchestrator>,
}

impl AttendanceService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[interface(name = "org.aeroface.Attendance1")]
impl AttendanceService {
    /// Enroll (or re-enroll) a face. `user_key` is a UUID or an email;
    /// `images` are (file name, encoded bytes) pairs.
    async fn enroll(
        &self,
        user_key: &str,
        display_name: &str,
        images: Vec<(String, Vec<u8>)>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user_key, images = images.len(), "enroll requested");
        let images: Vec<UploadedImage> = images
            .into_iter()
            .map(|(name, bytes)| UploadedImage { name, bytes })
            .collect();
        let display_name = Some(display_name.trim().to_string()).filter(|n| !n.is_empty());

        let report = self
            .orchestrator
            .enroll(user_key, display_name, images)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Run a verification cycle for `venue` over a window of frames.
    async fn verify(&self, venue: &str, frames: Vec<Vec<u8>>) -> zbus::fdo::Result<String> {
        tracing::debug!(venue, frames = frames.len(), "verify requested");
        let venue = Venue::new(venue).map_err(|e| to_fdo(e.into()))?;
        let report = self
            .orchestrator
            .verify(&venue, frames, Utc::now())
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Attendance log, oldest first. An empty `venue` lists every venue.
    async fn sessions(&self, venue: &str) -> zbus::fdo::Result<String> {
        let venue = if venue.trim().is_empty() {
            None
        } else {
            Some(Venue::new(venue).map_err(|e| to_fdo(e.into()))?)
        };
        let sessions = self
            .orchestrator
            .attendance_log(venue.as_ref())
            .await
            .map_err(to_fdo)?;
        to_json(&sessions)
    }

    /// Identities known to the store, without embeddings.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let records = self.orchestrator.identities().await.map_err(to_fdo)?;
        let out: Vec<_> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "email": r.email,
                    "display_name": r.display_name,
                    "embedding_dim": r.embedding_dim,
                    "updated_at": r.updated_at,
                })
            })
            .collect();
        to_json(&out)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.orchestrator.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
        })
        .to_string())
    }
}

/// Caller faults become `InvalidArgs`, everything else `Failed`.
fn to_fdo(err: ServiceError) -> zbus::fdo::Error {
    let body = err.body();
    let message = serde_json::to_string(&body).unwrap_or_else(|_| body.reason.clone());
    if body.status < 500 {
        tracing::info!(kind = body.kind, reason = %body.reason, "request rejected");
        zbus::fdo::Error::InvalidArgs(message)
    } else {
        tracing::error!(kind = body.kind, reason = %body.reason, "request failed");
        zbus::fdo::Error::Failed(message)
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeroface_core::{MatchError, ValidationError};

    #[test]
    fn validation_maps_to_invalid_args() {
        let err = to_fdo(ServiceError::Validation(ValidationError::ImageCount {
            count: 6,
            min: 1,
            max: 5,
        }));
        let message = match err {
            zbus::fdo::Error::InvalidArgs(message) => message,
            other => panic!("expected InvalidArgs, got {other:?}"),
        };
        let body: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(body["status"], 400);
        assert_eq!(body["kind"], "validation_error");
        assert_eq!(body["reason"], "expected between 1 and 5 images, got 6");
    }

    #[test]
    fn integrity_fault_maps_to_failed() {
        let err = to_fdo(ServiceError::Match(MatchError::DimensionMismatch {
            query: 512,
            candidate: 128,
        }));
        let message = match err {
            zbus::fdo::Error::Failed(message) => message,
            other => panic!("expected Failed, got {other:?}"),
        };
        assert!(message.contains("\"status\":500"));
        assert!(message.contains("match_error"));
    }
}

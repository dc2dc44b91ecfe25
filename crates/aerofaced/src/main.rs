use aeroface_core::{CosineMatcher, FaceDetector, FaceRecognizer};
use aeroface_store::{EmbeddingCipher, FaceStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod error;
mod keyed;
mod orchestrator;
mod tracker;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use orchestrator::{Orchestrator, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("aerofaced starting");

    let config = Config::load()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        similarity_threshold = config.similarity_threshold,
        liveness_threshold = config.liveness_threshold,
        dwell_secs = config.dwell.num_seconds(),
        check_interval_ms = config.check_interval.num_milliseconds(),
        "configuration resolved"
    );

    // Load models synchronously so startup fails fast.
    let scrfd_path = config.scrfd_model_path();
    let detector = FaceDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let recognizer = FaceRecognizer::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

    let engine = engine::spawn_engine(Box::new(detector), Box::new(recognizer))?;

    let cipher = config
        .embedding_passphrase
        .as_deref()
        .map(EmbeddingCipher::from_passphrase)
        .transpose()?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    let store = Arc::new(FaceStore::open(&config.db_path, cipher).await?);

    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        store,
        Box::new(CosineMatcher),
        Settings::from(&config),
    ));

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(orchestrator))?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, path = OBJECT_PATH, "aerofaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("aerofaced shutting down");

    Ok(())
}

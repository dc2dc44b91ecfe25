use aeroface_core::attendance::{AttendancePolicy, DEFAULT_DWELL_SECS};
use aeroface_core::liveness::DEFAULT_LIVENESS_THRESHOLD;
use aeroface_core::matcher::DEFAULT_SIMILARITY_THRESHOLD;
use chrono::TimeDelta;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/aeroface/aerofaced.toml";
const DEFAULT_CHECK_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

/// Raw `aerofaced.toml` contents; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub similarity_threshold: Option<f32>,
    pub liveness_threshold: Option<f32>,
    pub dwell_secs: Option<u64>,
    pub check_interval_ms: Option<u64>,
    pub reentry_cooldown_secs: Option<u64>,
    pub embedding_passphrase: Option<String>,
    pub bus: Option<BusKind>,
}

/// Daemon configuration: TOML file, then `AEROFACE_*` environment
/// overrides, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive identification.
    pub similarity_threshold: f32,
    /// Minimum mean face-center movement for a live capture.
    pub liveness_threshold: f32,
    /// Minimum time checked in before a checkout is accepted.
    pub dwell: TimeDelta,
    /// Minimum time between full verification cycles per venue.
    pub check_interval: TimeDelta,
    /// Cooldown after checkout before a new visit may open. None = never.
    pub reentry_cooldown: Option<TimeDelta>,
    /// Passphrase for embedding encryption at rest. None = plaintext.
    pub embedding_passphrase: Option<String>,
    pub bus: BusKind,
}

impl Config {
    /// Load from `$AEROFACE_CONFIG` (or the default path, if present) and
    /// the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("AEROFACE_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let file = if explicit.is_some() || path.exists() {
            let file = read_config_file(&path)?;
            tracing::info!(path = %path.display(), "configuration file loaded");
            file
        } else {
            ConfigFile::default()
        };

        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a config file with environment lookups. Malformed or
    /// out-of-range numbers are rejected rather than clamped.
    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let model_dir = env("AEROFACE_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(aeroface_core::default_model_dir);

        let db_path = env("AEROFACE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("aeroface.db"));

        let similarity_threshold = env_number::<f32>(&env, "AEROFACE_SIMILARITY_THRESHOLD")?
            .or(file.similarity_threshold)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        if !(-1.0..=1.0).contains(&similarity_threshold) {
            return Err(invalid(
                "similarity_threshold",
                format!("{similarity_threshold} is outside [-1, 1]"),
            ));
        }

        let liveness_threshold = env_number::<f32>(&env, "AEROFACE_LIVENESS_THRESHOLD")?
            .or(file.liveness_threshold)
            .unwrap_or(DEFAULT_LIVENESS_THRESHOLD);
        if !liveness_threshold.is_finite() || liveness_threshold < 0.0 {
            return Err(invalid(
                "liveness_threshold",
                format!("{liveness_threshold} must be a finite, non-negative number"),
            ));
        }

        let dwell_secs = env_number::<u64>(&env, "AEROFACE_DWELL_SECS")?
            .or(file.dwell_secs)
            .unwrap_or(DEFAULT_DWELL_SECS as u64);
        let check_interval_ms = env_number::<u64>(&env, "AEROFACE_CHECK_INTERVAL_MS")?
            .or(file.check_interval_ms)
            .unwrap_or(DEFAULT_CHECK_INTERVAL_MS);
        let reentry_cooldown_secs = env_number::<u64>(&env, "AEROFACE_REENTRY_COOLDOWN_SECS")?
            .or(file.reentry_cooldown_secs);

        let bus = match env("AEROFACE_BUS").as_deref() {
            Some("session") => BusKind::Session,
            Some("system") => BusKind::System,
            Some(other) => {
                return Err(invalid(
                    "AEROFACE_BUS",
                    format!("expected \"system\" or \"session\", got {other:?}"),
                ))
            }
            None => file.bus.unwrap_or_default(),
        };

        Ok(Self {
            model_dir,
            db_path,
            similarity_threshold,
            liveness_threshold,
            dwell: duration("dwell_secs", dwell_secs, TimeDelta::try_seconds)?,
            check_interval: duration(
                "check_interval_ms",
                check_interval_ms,
                TimeDelta::try_milliseconds,
            )?,
            reentry_cooldown: reentry_cooldown_secs
                .map(|secs| duration("reentry_cooldown_secs", secs, TimeDelta::try_seconds))
                .transpose()?,
            embedding_passphrase: env("AEROFACE_EMBEDDING_PASSPHRASE")
                .or(file.embedding_passphrase)
                .filter(|p| !p.is_empty()),
            bus,
        })
    }

    pub fn policy(&self) -> AttendancePolicy {
        AttendancePolicy {
            dwell_min: self.dwell,
            reentry_cooldown: self.reentry_cooldown,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn invalid(key: &'static str, message: String) -> ConfigError {
    ConfigError::Invalid { key, message }
}

/// Parse an optional environment override; a present but malformed value
/// is an error.
fn env_number<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(key, format!("{raw:?}: {e}")))
        })
        .transpose()
}

fn duration(
    key: &'static str,
    value: u64,
    to_delta: fn(i64) -> Option<TimeDelta>,
) -> Result<TimeDelta, ConfigError> {
    i64::try_from(value)
        .ok()
        .and_then(to_delta)
        .ok_or_else(|| invalid(key, format!("{value} is out of range")))
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("aeroface")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg =
            Config::resolve(ConfigFile::default(), env_of(&[("HOME", "/home/kiosk")])).unwrap();
        assert_eq!(cfg.similarity_threshold, 0.7);
        assert_eq!(cfg.liveness_threshold, 0.015);
        assert_eq!(cfg.dwell, TimeDelta::seconds(10));
        assert_eq!(cfg.check_interval, TimeDelta::milliseconds(1000));
        assert_eq!(cfg.reentry_cooldown, None);
        assert_eq!(
            cfg.db_path,
            PathBuf::from("/home/kiosk/.local/share/aeroface/aeroface.db")
        );
        assert_eq!(cfg.bus, BusKind::System);
        assert!(cfg.embedding_passphrase.is_none());
    }

    #[test]
    fn file_values_apply() {
        let file: ConfigFile = toml::from_str(
            r#"
            db_path = "/var/lib/aeroface/faces.db"
            similarity_threshold = 0.65
            dwell_secs = 30
            reentry_cooldown_secs = 600
            bus = "session"
            "#,
        )
        .unwrap();
        let cfg = Config::resolve(file, env_of(&[])).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/aeroface/faces.db"));
        assert_eq!(cfg.similarity_threshold, 0.65);
        assert_eq!(cfg.policy().dwell_min, TimeDelta::seconds(30));
        assert_eq!(cfg.policy().reentry_cooldown, Some(TimeDelta::seconds(600)));
        assert_eq!(cfg.bus, BusKind::Session);
    }

    #[test]
    fn env_overrides_file() {
        let file = ConfigFile {
            similarity_threshold: Some(0.5),
            check_interval_ms: Some(250),
            ..ConfigFile::default()
        };
        let cfg = Config::resolve(
            file,
            env_of(&[
                ("AEROFACE_SIMILARITY_THRESHOLD", "0.8"),
                ("AEROFACE_MODEL_DIR", "/opt/models"),
                ("AEROFACE_EMBEDDING_PASSPHRASE", "s3cret"),
            ]),
        )
        .unwrap();
        assert!((cfg.similarity_threshold - 0.8).abs() < 1e-6);
        assert_eq!(cfg.check_interval, TimeDelta::milliseconds(250));
        assert_eq!(cfg.scrfd_model_path(), "/opt/models/det_10g.onnx");
        assert_eq!(cfg.arcface_model_path(), "/opt/models/w600k_r50.onnx");
        assert_eq!(cfg.embedding_passphrase.as_deref(), Some("s3cret"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<ConfigFile>("venue_color = 3").is_err());
    }

    fn rejected_key(file: ConfigFile, pairs: &[(&str, &str)]) -> &'static str {
        match Config::resolve(file, env_of(pairs)) {
            Err(ConfigError::Invalid { key, .. }) => key,
            other => panic!("expected an invalid value, got {other:?}"),
        }
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let max = u64::MAX.to_string();
        assert_eq!(
            rejected_key(ConfigFile::default(), &[("AEROFACE_DWELL_SECS", &max)]),
            "dwell_secs"
        );
        assert_eq!(
            rejected_key(
                ConfigFile::default(),
                &[("AEROFACE_REENTRY_COOLDOWN_SECS", "10000000000000000")]
            ),
            "reentry_cooldown_secs"
        );
        let file = ConfigFile {
            check_interval_ms: Some(u64::MAX),
            ..ConfigFile::default()
        };
        assert_eq!(rejected_key(file, &[]), "check_interval_ms");
    }

    #[test]
    fn malformed_env_numbers_are_rejected() {
        assert_eq!(
            rejected_key(ConfigFile::default(), &[("AEROFACE_DWELL_SECS", "-5")]),
            "AEROFACE_DWELL_SECS"
        );
        assert_eq!(
            rejected_key(ConfigFile::default(), &[("AEROFACE_CHECK_INTERVAL_MS", "soon")]),
            "AEROFACE_CHECK_INTERVAL_MS"
        );
        assert_eq!(
            rejected_key(ConfigFile::default(), &[("AEROFACE_BUS", "user")]),
            "AEROFACE_BUS"
        );
    }

    #[test]
    fn thresholds_must_be_finite_and_in_range() {
        assert_eq!(
            rejected_key(ConfigFile::default(), &[("AEROFACE_SIMILARITY_THRESHOLD", "NaN")]),
            "similarity_threshold"
        );
        assert_eq!(
            rejected_key(ConfigFile::default(), &[("AEROFACE_SIMILARITY_THRESHOLD", "1.5")]),
            "similarity_threshold"
        );
        assert_eq!(
            rejected_key(ConfigFile::default(), &[("AEROFACE_LIVENESS_THRESHOLD", "inf")]),
            "liveness_threshold"
        );
        let file = ConfigFile {
            liveness_threshold: Some(-0.1),
            ..ConfigFile::default()
        };
        assert_eq!(rejected_key(file, &[]), "liveness_threshold");
    }
}

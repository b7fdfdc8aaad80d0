use rollcall_core::{PipelineConfig, SubjectSelection};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Invalid(#[from] rollcall_core::InvalidConfig),
}

/// Session host configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite embeddings database.
    pub db_path: PathBuf,
    /// Caller-side deadline for one frame; expiry yields a `TIMEOUT` verdict.
    pub frame_timeout_ms: u64,
    pub pipeline: PipelineConfig,
}

/// On-disk TOML layout. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    frame_timeout_ms: Option<u64>,
    pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("embeddings.db"),
            frame_timeout_ms: 500,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then let `ROLLCALL_*` environment variables override it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env(|key| std::env::var(key).ok());
        config.pipeline.validate()?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        let defaults = Self::default();
        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            frame_timeout_ms: file.frame_timeout_ms.unwrap_or(defaults.frame_timeout_ms),
            pipeline: file.pipeline,
        })
    }

    /// Overlay values found through `lookup`. Unparsable values are ignored
    /// with a warning and the current value is kept.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.frame_timeout_ms = env_or(&lookup, "ROLLCALL_FRAME_TIMEOUT_MS", self.frame_timeout_ms);

        let p = &mut self.pipeline;
        p.mode = env_or(&lookup, "ROLLCALL_MODE", p.mode);
        p.skip_interval = env_or(&lookup, "ROLLCALL_SKIP_INTERVAL", p.skip_interval);
        p.iou_threshold = env_or(&lookup, "ROLLCALL_IOU_THRESHOLD", p.iou_threshold);
        p.min_quality_percent = env_or(&lookup, "ROLLCALL_MIN_QUALITY_PERCENT", p.min_quality_percent);
        p.top_k = env_or(&lookup, "ROLLCALL_TOP_K", p.top_k);
        p.spoof_threshold = env_or(&lookup, "ROLLCALL_SPOOF_THRESHOLD", p.spoof_threshold);
        p.max_pose_angle = env_or(&lookup, "ROLLCALL_MAX_POSE_ANGLE", p.max_pose_angle);
        p.min_eye_displacement = env_or(&lookup, "ROLLCALL_MIN_EYE_DISPLACEMENT", p.min_eye_displacement);
        p.max_cached_embeddings = env_or(&lookup, "ROLLCALL_MAX_CACHED_EMBEDDINGS", p.max_cached_embeddings);
        if let Some(v) = lookup("ROLLCALL_SUBJECT_SELECTION") {
            match v.trim().to_ascii_lowercase().as_str() {
                "first" => p.subject_selection = SubjectSelection::First,
                "largest" => p.subject_selection = SubjectSelection::Largest,
                other => tracing::warn!(value = other, "ROLLCALL_SUBJECT_SELECTION: expected first or largest"),
            }
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(v) => match v.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(key, value = %v, "ignoring unparsable environment value");
                current
            }
        },
        None => current,
    }
}

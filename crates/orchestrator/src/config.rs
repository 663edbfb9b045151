//! Pipeline configuration
//!
//! Loaded from YAML; every field has a default. Environment variables
//! override the file for the options operators tune most often:
//!
//! | Variable | Option |
//! |---|---|
//! | `LIPWATCH_MAX_WORKERS` | `max_workers` |
//! | `LIPWATCH_BUFFER_SIZE` | `buffer_size` |
//! | `LIPWATCH_WINDOW_SIZE` | `window_size` |
//! | `LIPWATCH_CONFIDENCE_THRESHOLD` | `confidence_threshold` |
//! | `LIPWATCH_RECOGNIZER_URL` | `recognizer.url` |

use lipwatch_common::{PipelineError, StreamDescriptor};
use lipwatch_features::ExtractorConfig;
use lipwatch_ingestion::CaptureSettings;
use lipwatch_recognition::RecognizerConfig;
use lipwatch_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid value {value:?} for {var}")]
    Env { var: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::InvalidConfig(err.to_string())
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of recognition workers
    pub max_workers: usize,

    /// Frame ring buffer capacity per stream
    pub buffer_size: usize,

    /// Features per detection window
    #[serde(alias = "sequence_length")]
    pub window_size: usize,

    /// Gate threshold on the latest feature's quality score
    pub confidence_threshold: f32,

    /// Split each job into recognizer calls of at most this many features
    pub frame_batch_size: Option<usize>,

    /// Capacity of each worker's input queue
    pub worker_queue_capacity: usize,

    /// How often an idle worker or collector checks for shutdown
    pub worker_poll_interval_ms: u64,

    /// Bounded wait for workers to exit before they are force-stopped
    pub shutdown_timeout_ms: u64,

    /// Bounded wait for each capture and analysis loop to exit
    pub capture_join_timeout_ms: u64,

    /// Bounded wait for the result collector to drain
    pub collector_drain_timeout_ms: u64,

    /// Delay before retrying a failed source read
    pub read_backoff_ms: u64,

    /// Capture pacing when no frame rate is known
    pub default_frame_interval_ms: u64,

    /// Queue depth log interval (0 disables the monitor)
    pub monitor_interval_ms: u64,

    pub streams: Vec<StreamDescriptor>,

    pub extractor: ExtractorConfig,

    pub recognizer: RecognizerConfig,

    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            buffer_size: 30,
            window_size: 30,
            confidence_threshold: 0.7,
            frame_batch_size: None,
            worker_queue_capacity: 16,
            worker_poll_interval_ms: 1000,
            shutdown_timeout_ms: 5000,
            capture_join_timeout_ms: 2000,
            collector_drain_timeout_ms: 5000,
            read_backoff_ms: 100,
            default_frame_interval_ms: 33,
            monitor_interval_ms: 5000,
            streams: Vec::new(),
            extractor: ExtractorConfig::default(),
            recognizer: RecognizerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value,
    })
}

impl PipelineConfig {
    /// Parse YAML without applying overrides or validation
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` on malformed YAML or unknown value types.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read `path`, apply process environment overrides and validate
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |var| std::env::var(var).ok())
    }

    /// [`PipelineConfig::load`] with overrides taken from `lookup` instead of
    /// the process environment
    ///
    /// # Errors
    ///
    /// Same as [`PipelineConfig::load`].
    pub fn load_with_env(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&yaml)?;
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Env` if a variable is set to an unparsable value.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("LIPWATCH_MAX_WORKERS") {
            self.max_workers = parse_env("LIPWATCH_MAX_WORKERS", v)?;
        }
        if let Some(v) = lookup("LIPWATCH_BUFFER_SIZE") {
            self.buffer_size = parse_env("LIPWATCH_BUFFER_SIZE", v)?;
        }
        if let Some(v) = lookup("LIPWATCH_WINDOW_SIZE") {
            self.window_size = parse_env("LIPWATCH_WINDOW_SIZE", v)?;
        }
        if let Some(v) = lookup("LIPWATCH_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = parse_env("LIPWATCH_CONFIDENCE_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("LIPWATCH_RECOGNIZER_URL") {
            let v = v.trim().to_string();
            self.recognizer.url = (!v.is_empty()).then_some(v);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for (name, value) in [
            ("max_workers", self.max_workers),
            ("buffer_size", self.buffer_size),
            ("window_size", self.window_size),
            ("worker_queue_capacity", self.worker_queue_capacity),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be at least 1"));
            }
        }
        if self.frame_batch_size == Some(0) {
            return invalid("frame_batch_size must be at least 1 when set".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return invalid(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.worker_poll_interval_ms == 0 {
            return invalid("worker_poll_interval_ms must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.id.as_str().is_empty() {
                return invalid("stream id must not be empty".to_string());
            }
            if !seen.insert(&stream.id) {
                return invalid(format!("duplicate stream id {}", stream.id));
            }
            if stream.locator.is_empty() {
                return invalid(format!("stream {} has no source", stream.id));
            }
            if let Some(fps) = stream.target_fps {
                if !(fps.is_finite() && fps > 0.0) {
                    return invalid(format!("stream {} has invalid target_fps {fps}", stream.id));
                }
            }
            if let Some([w, h]) = stream.preprocess.resize {
                if w == 0 || h == 0 {
                    return invalid(format!("stream {} has a zero resize dimension", stream.id));
                }
            }
        }

        let [w, h] = self.extractor.target_size;
        if w == 0 || h == 0 {
            return invalid("extractor.target_size must be non-zero".to_string());
        }
        Ok(())
    }

    /// Streams that should be started
    pub fn enabled_streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.iter().filter(|s| s.enabled)
    }

    #[must_use]
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            read_backoff: Duration::from_millis(self.read_backoff_ms),
            default_frame_interval: Duration::from_millis(self.default_frame_interval_ms),
        }
    }

    #[must_use]
    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn capture_join_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_join_timeout_ms)
    }

    #[must_use]
    pub fn collector_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_drain_timeout_ms)
    }

    /// None disables the queue monitor
    #[must_use]
    pub fn monitor_interval(&self) -> Option<Duration> {
        (self.monitor_interval_ms > 0).then(|| Duration::from_millis(self.monitor_interval_ms))
    }
}

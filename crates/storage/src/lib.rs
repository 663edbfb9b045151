//! Storage layer for detection results
//!
//! The result collector hands detection results to two external
//! collaborators:
//! - **Persistence** ([`PersistenceSink`]): durable record of every result,
//!   failed ones included; returns an id
//! - **Publication** ([`PublicationSink`]): notification for downstream
//!   consumers, successful detections only
//!
//! Built-in implementations:
//! - [`JsonLinesStore`]: one JSON object per line in a local file
//! - [`LogPublisher`]: publishes records as structured log events
//! - [`MemorySink`]: keeps everything in memory (embedding, tests)
//!
//! # Example
//!
//! ```rust,no_run
//! use lipwatch_storage::{JsonLinesStore, PersistenceSink};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = JsonLinesStore::open("detections.jsonl")?;
//! # let record: lipwatch_storage::DetectionRecord = todo!();
//! let id = store.save(&record)?;
//! println!("stored as {id}");
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use lipwatch_common::{DetectionResult, JobError, StreamId, WorkerId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub mod jsonl_store;
pub mod memory;
pub mod publisher;

pub use jsonl_store::{JsonLinesStore, StoredRecord};
pub use memory::MemorySink;
pub use publisher::LogPublisher;

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Publish failed: {0}")]
    PublishError(String),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// JSON-lines file receiving every detection record
    /// (None = keep records in memory only)
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
}

/// Detection as persisted and published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Correlation id of the job that produced this detection
    pub correlation_id: Uuid,

    pub stream_id: StreamId,

    /// Location tag of the stream
    pub location: String,

    pub worker: WorkerId,

    /// Predicted text, possibly empty
    pub text: String,

    /// Recognition confidence (0.0 to 1.0)
    pub confidence: f32,

    /// Wall-clock processing time in milliseconds
    pub latency_ms: u64,

    pub submitted_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<&DetectionResult> for DetectionRecord {
    fn from(result: &DetectionResult) -> Self {
        Self {
            correlation_id: result.correlation_id,
            stream_id: result.stream_id.clone(),
            location: result.location.clone(),
            worker: result.worker,
            text: result.text.clone(),
            confidence: result.confidence,
            latency_ms: u64::try_from(result.latency.as_millis()).unwrap_or(u64::MAX),
            submitted_at: result.submitted_at,
            completed_at: result.completed_at,
            error: result.error.clone(),
        }
    }
}

/// Durable storage for detection records
pub trait PersistenceSink: Send + Sync {
    /// Store a record and return its id
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be stored. Callers do not retry.
    fn save(&self, record: &DetectionRecord) -> StorageResult<String>;
}

/// Notification channel for detection records
pub trait PublicationSink: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the record cannot be published. Callers do not retry.
    fn publish(&self, record: &DetectionRecord) -> StorageResult<()>;
}

//! Publication through the tracing pipeline
//!
//! Each record becomes one `info` event on the `lipwatch::detections` target
//! with the record serialized as JSON, so any subscriber layer (stdout, file,
//! log shipper) can forward detections without a message broker.

use crate::{DetectionRecord, PublicationSink, StorageResult};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct LogPublisher {
    published: AtomicU64,
}

impl LogPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records published so far
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl PublicationSink for LogPublisher {
    fn publish(&self, record: &DetectionRecord) -> StorageResult<()> {
        let payload = serde_json::to_string(record)?;
        info!(
            target: "lipwatch::detections",
            stream = %record.stream_id,
            location = %record.location,
            confidence = record.confidence,
            "{payload}"
        );
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

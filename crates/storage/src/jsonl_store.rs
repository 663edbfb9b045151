//! JSON-lines persistence
//!
//! Each saved record is appended as one line: the record's fields plus a
//! generated `id`. The file is flushed after every line so a crash loses at
//! most the record being written.

use crate::{DetectionRecord, PersistenceSink, StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

/// One line of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    #[serde(flatten)]
    pub record: DetectionRecord,
}

/// Append-only JSON-lines file
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesStore {
    /// Open `path` for appending, creating it and its parent directory if needed
    ///
    /// # Errors
    ///
    /// Returns `StorageError::IoError` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Persisting detections to {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record stored at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is not a record.
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Vec<StoredRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl PersistenceSink for JsonLinesStore {
    fn save(&self, record: &DetectionRecord) -> StorageResult<String> {
        let stored = StoredRecord {
            id: Uuid::new_v4().to_string(),
            record: record.clone(),
        };
        let line = serde_json::to_string(&stored)?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}").map_err(StorageError::IoError)?;
        writer.flush()?;

        debug!("Stored detection {} as {}", record.correlation_id, stored.id);
        Ok(stored.id)
    }
}

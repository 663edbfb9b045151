//! In-memory sink implementing both persistence and publication

use crate::{DetectionRecord, PersistenceSink, PublicationSink, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct MemorySink {
    saved: Mutex<Vec<(String, DetectionRecord)>>,
    published: Mutex<Vec<DetectionRecord>>,
    fail_saves: AtomicBool,
    fail_publishes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail with `StorageError::Unavailable`
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent publishes fail with `StorageError::PublishError`
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Saved records with their ids, in save order
    #[must_use]
    pub fn saved(&self) -> Vec<(String, DetectionRecord)> {
        lock(&self.saved).clone()
    }

    /// Published records, in publish order
    #[must_use]
    pub fn published(&self) -> Vec<DetectionRecord> {
        lock(&self.published).clone()
    }
}

impl PersistenceSink for MemorySink {
    fn save(&self, record: &DetectionRecord) -> StorageResult<String> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory sink is failing saves".to_string()));
        }
        let mut saved = lock(&self.saved);
        let id = format!("mem-{}", saved.len() + 1);
        saved.push((id.clone(), record.clone()));
        Ok(id)
    }
}

impl PublicationSink for MemorySink {
    fn publish(&self, record: &DetectionRecord) -> StorageResult<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(StorageError::PublishError("memory sink is failing publishes".to_string()));
        }
        lock(&self.published).push(record.clone());
        Ok(())
    }
}

//! Pipeline counters
//!
//! Every absorbed per-item failure (drop, failed job, sink error) increments
//! a counter here so it stays observable without unwinding the pipeline.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters, updated from every pipeline thread
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub(crate) frames_analyzed: AtomicU64,
    pub(crate) no_detections: AtomicU64,
    pub(crate) jobs_dispatched: AtomicU64,
    pub(crate) jobs_dropped_queue_full: AtomicU64,
    pub(crate) jobs_dropped_unavailable: AtomicU64,
    pub(crate) results_ok: AtomicU64,
    pub(crate) results_failed: AtomicU64,
    pub(crate) results_abandoned: AtomicU64,
    pub(crate) records_saved: AtomicU64,
    pub(crate) records_published: AtomicU64,
    pub(crate) sink_failures: AtomicU64,
    pub(crate) workers_crashed: AtomicU64,
    pub(crate) workers_force_stopped: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl PipelineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs dropped for any reason
    #[must_use]
    pub fn jobs_dropped(&self) -> u64 {
        get(&self.jobs_dropped_queue_full) + get(&self.jobs_dropped_unavailable)
    }

    #[must_use]
    pub fn jobs_dispatched(&self) -> u64 {
        get(&self.jobs_dispatched)
    }

    /// Point-in-time copy of the orchestrator counters
    ///
    /// Capture-side fields are left at zero; the pipeline fills them in from
    /// its capture loops and ring buffers.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: 0,
            frames_evicted: 0,
            read_failures: 0,
            frames_analyzed: get(&self.frames_analyzed),
            no_detections: get(&self.no_detections),
            jobs_dispatched: get(&self.jobs_dispatched),
            jobs_dropped_queue_full: get(&self.jobs_dropped_queue_full),
            jobs_dropped_unavailable: get(&self.jobs_dropped_unavailable),
            results_ok: get(&self.results_ok),
            results_failed: get(&self.results_failed),
            results_abandoned: get(&self.results_abandoned),
            records_saved: get(&self.records_saved),
            records_published: get(&self.records_published),
            sink_failures: get(&self.sink_failures),
            workers_crashed: get(&self.workers_crashed),
            workers_force_stopped: get(&self.workers_force_stopped),
        }
    }
}

/// Serializable counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_evicted: u64,
    pub read_failures: u64,
    pub frames_analyzed: u64,
    pub no_detections: u64,
    pub jobs_dispatched: u64,
    pub jobs_dropped_queue_full: u64,
    pub jobs_dropped_unavailable: u64,
    pub results_ok: u64,
    pub results_failed: u64,
    pub results_abandoned: u64,
    pub records_saved: u64,
    pub records_published: u64,
    pub sink_failures: u64,
    pub workers_crashed: u64,
    pub workers_force_stopped: u64,
}

impl StatsSnapshot {
    /// Results of any kind delivered to the collector
    #[must_use]
    pub fn results_total(&self) -> u64 {
        self.results_ok + self.results_failed + self.results_abandoned
    }
}

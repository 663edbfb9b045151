//! Stream-to-worker routing with drop-new backpressure
//!
//! Every stream is assigned to `stable_hash(stream_id) % pool_size` once,
//! when the dispatcher is built. The mapping is never mutated afterwards, so
//! analysis threads share the dispatcher without locking and all jobs of a
//! stream reach the same worker in submission order.
//!
//! When the assigned queue is full the new job is dropped, never an older
//! queued one, and the drop is counted and logged.

use crate::stats::{bump, PipelineStats};
use crate::worker::{WorkerMessage, WorkerQueue, WorkerState};
use crossbeam_channel::TrySendError;
use lipwatch_common::{DetectionJob, PipelineError, Result, StreamId, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hash of a stream id that is stable across calls, processes and platforms
///
/// First 8 bytes of the BLAKE3 digest, little-endian.
#[must_use]
pub fn stable_hash(stream_id: &StreamId) -> u64 {
    let digest = blake3::hash(stream_id.as_str().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Worker index for `stream_id` in a pool of `pool_size` workers
#[must_use]
pub fn assign_worker(stream_id: &StreamId, pool_size: usize) -> WorkerId {
    let pool_size = pool_size.max(1) as u64;
    WorkerId((stable_hash(stream_id) % pool_size) as usize)
}

pub struct Dispatcher {
    queues: Vec<WorkerQueue>,
    assignments: HashMap<StreamId, WorkerId>,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    /// Build the routing table for `streams` over `queues`
    ///
    /// `queues[i]` must belong to worker `i`.
    pub fn new(
        queues: Vec<WorkerQueue>,
        streams: impl IntoIterator<Item = StreamId>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let pool_size = queues.len();
        let assignments: HashMap<StreamId, WorkerId> = streams
            .into_iter()
            .map(|stream| {
                let worker = assign_worker(&stream, pool_size);
                debug!(stream = %stream, "Assigned to {}", worker);
                (stream, worker)
            })
            .collect();

        Self {
            queues,
            assignments,
            stats,
        }
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.queues.len()
    }

    /// Worker assigned to `stream_id`, if the stream is registered
    #[must_use]
    pub fn worker_for(&self, stream_id: &StreamId) -> Option<WorkerId> {
        self.assignments.get(stream_id).copied()
    }

    #[must_use]
    pub fn assignments(&self) -> &HashMap<StreamId, WorkerId> {
        &self.assignments
    }

    /// Enqueue `job` on its stream's worker without blocking
    ///
    /// # Errors
    ///
    /// - `PipelineError::UnknownStream` if the stream was never registered
    /// - `PipelineError::QueueFull` if the worker's queue is at capacity;
    ///   the job is dropped
    /// - `PipelineError::WorkerUnavailable` if the worker is not running;
    ///   the job is dropped
    pub fn submit(&self, job: DetectionJob) -> Result<WorkerId> {
        let Some(worker) = self.worker_for(&job.stream_id) else {
            return Err(PipelineError::UnknownStream(job.stream_id));
        };
        let Some(queue) = self.queues.get(worker.0) else {
            bump(&self.stats.jobs_dropped_unavailable);
            warn!(stream = %job.stream_id, "{} has no queue; dropping job {}", worker, job.correlation_id);
            return Err(PipelineError::WorkerUnavailable { worker });
        };

        let state = queue.state();
        if state != WorkerState::Running {
            bump(&self.stats.jobs_dropped_unavailable);
            warn!(stream = %job.stream_id, "{} is {:?}; dropping job {}", worker, state, job.correlation_id);
            return Err(PipelineError::WorkerUnavailable { worker });
        }

        let stream = job.stream_id.clone();
        let correlation_id = job.correlation_id;
        match queue.sender.try_send(WorkerMessage::Job(job)) {
            Ok(()) => {
                bump(&self.stats.jobs_dispatched);
                Ok(worker)
            }
            Err(TrySendError::Full(_)) => {
                bump(&self.stats.jobs_dropped_queue_full);
                let err = PipelineError::QueueFull { worker };
                warn!(stream = %stream, "{}; dropping new job {}", err, correlation_id);
                Err(err)
            }
            Err(TrySendError::Disconnected(_)) => {
                bump(&self.stats.jobs_dropped_unavailable);
                warn!(stream = %stream, "{} has gone away; dropping job {}", worker, correlation_id);
                Err(PipelineError::WorkerUnavailable { worker })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lipwatch_common::FeatureVector;

    fn job(stream: &str) -> DetectionJob {
        DetectionJob::new(StreamId::new(stream), "hall", vec![FeatureVector::new(vec![1.0], 0.9)], 0, 0)
    }

    #[test]
    fn test_stable_hash_is_fixed() {
        let id = StreamId::new("entrance-cam");
        assert_eq!(stable_hash(&id), stable_hash(&StreamId::new("entrance-cam")));
        assert_ne!(stable_hash(&id), stable_hash(&StreamId::new("lobby-cam")));

        // Pinned so a change in hashing is caught: routing must survive restarts
        let digest = blake3::hash(b"entrance-cam");
        let expected = u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap());
        assert_eq!(stable_hash(&id), expected);
    }

    #[test]
    fn test_assignment_within_pool() {
        for i in 0..50 {
            let id = StreamId::new(format!("cam-{i}"));
            assert!(assign_worker(&id, 3).0 < 3);
            assert_eq!(assign_worker(&id, 1), WorkerId(0));
        }
        assert_eq!(assign_worker(&StreamId::new("x"), 0), WorkerId(0));
    }

    #[test]
    fn test_unknown_stream_is_rejected() {
        let (queue, _rx) = WorkerQueue::detached(WorkerId(0), 2);
        let dispatcher = Dispatcher::new(vec![queue], [StreamId::new("a")], Arc::new(PipelineStats::new()));
        assert!(matches!(dispatcher.submit(job("b")), Err(PipelineError::UnknownStream(_))));
    }

    #[test]
    fn test_full_queue_drops_the_new_job() {
        let (queue, rx) = WorkerQueue::detached(WorkerId(0), 2);
        let stats = Arc::new(PipelineStats::new());
        let dispatcher = Dispatcher::new(vec![queue], [StreamId::new("a")], Arc::clone(&stats));

        let first = job("a");
        let second = job("a");
        let ids = [first.correlation_id, second.correlation_id];
        dispatcher.submit(first).unwrap();
        dispatcher.submit(second).unwrap();
        let err = dispatcher.submit(job("a")).unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull { worker: WorkerId(0) }));

        let queued: Vec<_> = rx
            .try_iter()
            .filter_map(|m| match m {
                WorkerMessage::Job(job) => Some(job.correlation_id),
                WorkerMessage::Shutdown => None,
            })
            .collect();
        assert_eq!(queued, ids);
        assert_eq!(stats.snapshot().jobs_dropped_queue_full, 1);
        assert_eq!(stats.jobs_dispatched(), 2);
    }

    #[test]
    fn test_stopped_worker_is_unavailable() {
        let (queue, _rx) = WorkerQueue::detached(WorkerId(0), 2);
        queue.status.set(WorkerState::Crashed);
        let stats = Arc::new(PipelineStats::new());
        let dispatcher = Dispatcher::new(vec![queue], [StreamId::new("a")], Arc::clone(&stats));

        let err = dispatcher.submit(job("a")).unwrap_err();
        assert!(matches!(err, PipelineError::WorkerUnavailable { worker: WorkerId(0) }));
        assert_eq!(stats.snapshot().jobs_dropped_unavailable, 1);
    }

    #[test]
    fn test_disconnected_queue_is_unavailable() {
        let (queue, rx) = WorkerQueue::detached(WorkerId(0), 2);
        drop(rx);
        let stats = Arc::new(PipelineStats::new());
        let dispatcher = Dispatcher::new(vec![queue], [StreamId::new("a")], Arc::clone(&stats));

        assert!(matches!(
            dispatcher.submit(job("a")),
            Err(PipelineError::WorkerUnavailable { .. })
        ));
        assert_eq!(stats.jobs_dropped(), 1);
    }

    #[test]
    fn test_empty_pool_drop_is_counted() {
        let stats = Arc::new(PipelineStats::new());
        let dispatcher = Dispatcher::new(Vec::new(), [StreamId::new("a")], Arc::clone(&stats));

        assert!(matches!(
            dispatcher.submit(job("a")),
            Err(PipelineError::WorkerUnavailable { worker: WorkerId(0) })
        ));
        assert_eq!(stats.snapshot().jobs_dropped_unavailable, 1);
        assert_eq!(stats.jobs_dispatched(), 0);
    }
}

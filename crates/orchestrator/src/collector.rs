//! Result collector
//!
//! Single consumer of the shared output queue. Every result is turned into a
//! [`DetectionRecord`] and saved; successful detections are then published.
//! A failing sink is logged and counted, never retried, and never stops the
//! collector from draining the next result.

use crate::stats::{bump, PipelineStats};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use lipwatch_common::{DetectionResult, JobErrorCode, PipelineError, Result};
use lipwatch_storage::{DetectionRecord, PersistenceSink, PublicationSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub struct ResultCollector {
    receiver: Receiver<DetectionResult>,
    draining: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl ResultCollector {
    /// Start draining `receiver` on the `collector` thread
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Startup` if the thread cannot be spawned.
    pub fn start(
        receiver: Receiver<DetectionResult>,
        persistence: Arc<dyn PersistenceSink>,
        publication: Arc<dyn PublicationSink>,
        stats: Arc<PipelineStats>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let draining = Arc::new(AtomicBool::new(false));
        let abort = Arc::new(AtomicBool::new(false));

        let delivery = Delivery {
            persistence,
            publication,
            stats,
        };
        let rx = receiver.clone();
        let draining_flag = Arc::clone(&draining);
        let abort_flag = Arc::clone(&abort);

        let thread = thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || delivery.run(&rx, &draining_flag, &abort_flag, poll_interval))
            .map_err(|e| PipelineError::Startup(format!("failed to spawn collector: {e}")))?;

        Ok(Self {
            receiver,
            draining,
            abort,
            thread: Some(thread),
        })
    }

    /// Results waiting to be collected
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.receiver.len()
    }

    /// Drain what is left in the queue, then stop
    ///
    /// Waits at most `timeout`. Returns the number of results still queued
    /// when the collector stopped (0 after a complete drain).
    pub fn finish(mut self, timeout: Duration) -> usize {
        self.draining.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;

        let Some(handle) = self.thread.take() else {
            return self.receiver.len();
        };
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if !handle.is_finished() {
            self.abort.store(true, Ordering::Release);
            let err = PipelineError::ShutdownTimeout {
                component: "collector".to_string(),
                timeout,
            };
            error!("{}; {} results left undelivered", err, self.receiver.len());
            return self.receiver.len();
        }

        match handle.join() {
            Ok(delivered) => info!("Collector stopped after {} results", delivered),
            Err(_) => error!("Collector thread panicked"),
        }
        self.receiver.len()
    }
}

impl Drop for ResultCollector {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
    }
}

struct Delivery {
    persistence: Arc<dyn PersistenceSink>,
    publication: Arc<dyn PublicationSink>,
    stats: Arc<PipelineStats>,
}

impl Delivery {
    fn run(
        &self,
        receiver: &Receiver<DetectionResult>,
        draining: &AtomicBool,
        abort: &AtomicBool,
        poll_interval: Duration,
    ) -> u64 {
        let mut delivered = 0u64;
        loop {
            if abort.load(Ordering::Acquire) {
                break;
            }
            match receiver.recv_timeout(poll_interval) {
                Ok(result) => {
                    self.deliver(&result);
                    delivered += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if draining.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if draining.load(Ordering::Acquire) && receiver.is_empty() {
                break;
            }
        }
        delivered
    }

    fn deliver(&self, result: &DetectionResult) {
        match &result.error {
            None => bump(&self.stats.results_ok),
            Some(e) if e.code == JobErrorCode::Abandoned => bump(&self.stats.results_abandoned),
            Some(_) => bump(&self.stats.results_failed),
        }

        let record = DetectionRecord::from(result);
        let id = match self.persistence.save(&record) {
            Ok(id) => {
                bump(&self.stats.records_saved);
                id
            }
            Err(e) => {
                bump(&self.stats.sink_failures);
                warn!(stream = %result.stream_id, "Failed to persist result {}: {}", result.correlation_id, e);
                return;
            }
        };

        if !result.is_success() {
            debug!(stream = %result.stream_id, "Stored failed job {} as {}", result.correlation_id, id);
            return;
        }

        match self.publication.publish(&record) {
            Ok(()) => {
                bump(&self.stats.records_published);
                debug!(stream = %result.stream_id, "Published detection {} ({})", result.correlation_id, id);
            }
            Err(e) => {
                bump(&self.stats.sink_failures);
                warn!(stream = %result.stream_id, "Failed to publish detection {}: {}", result.correlation_id, e);
            }
        }
    }
}

//! Periodic queue-depth logging

use lipwatch_common::{PipelineError, Result, StreamId, WorkerId};
use lipwatch_ingestion::capture::sleep_unless_stopped;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Depth of every queue in the pipeline at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub workers: Vec<(WorkerId, usize)>,
    pub output: usize,
    pub buffers: Vec<(StreamId, usize)>,
}

pub type DepthProbe = Box<dyn Fn() -> QueueDepths + Send>;

pub struct QueueMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl QueueMonitor {
    /// Log `probe()` every `interval` on the `monitor` thread
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Startup` if the thread cannot be spawned.
    pub fn start(probe: DepthProbe, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    sleep_unless_stopped(&flag, interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let depths = probe();
                    for (worker, depth) in &depths.workers {
                        debug!(worker = %worker, "Input queue depth {}", depth);
                    }
                    for (stream, len) in &depths.buffers {
                        debug!(stream = %stream, "Ring buffer holds {} frames", len);
                    }
                    debug!("Output queue depth {}", depths.output);
                }
            })
            .map_err(|e| PipelineError::Startup(format!("failed to spawn monitor: {e}")))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QueueMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

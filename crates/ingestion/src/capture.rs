//! Per-stream capture loop
//!
//! One thread per stream: read a frame from the source handle, preprocess
//! it, stamp it with the next sequence number and push it into the stream's
//! ring buffer. Read failures are logged and retried after a fixed backoff;
//! they never end the loop. The loop exits when its stop flag is raised or a
//! file source reaches end-of-stream, and releases the source on the way out.

use crate::preprocess::preprocess;
use crate::ring_buffer::RingBuffer;
use crate::source::{FrameSource, ReadOutcome};
use chrono::Utc;
use lipwatch_common::{FrameSample, PipelineError, Result, StreamDescriptor, StreamId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest uninterrupted sleep; bounds how late a stop request is observed
const STOP_POLL: Duration = Duration::from_millis(20);

/// Timing knobs for a capture loop
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Delay before retrying after a failed read
    pub read_backoff: Duration,
    /// Pacing used when neither the stream nor the source gives a frame rate
    pub default_frame_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            read_backoff: Duration::from_millis(100),
            default_frame_interval: Duration::from_millis(33),
        }
    }
}

/// Counters owned by one capture loop
#[derive(Debug, Default)]
pub struct CaptureCounters {
    captured: AtomicU64,
    read_failures: AtomicU64,
}

impl CaptureCounters {
    #[must_use]
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }
}

/// Handle to a running capture loop
pub struct StreamCapture {
    stream_id: StreamId,
    stop: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    handle: Option<JoinHandle<()>>,
}

impl StreamCapture {
    /// Spawn the capture thread for `descriptor`, reading from an already
    /// opened `source`
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Startup` if the thread cannot be spawned.
    pub fn start(
        descriptor: StreamDescriptor,
        source: Box<dyn FrameSource>,
        buffer: Arc<RingBuffer<FrameSample>>,
        settings: CaptureSettings,
    ) -> Result<Self> {
        let stream_id = descriptor.id.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(CaptureCounters::default());

        let worker = CaptureLoop {
            descriptor,
            source,
            buffer,
            settings,
            stop: Arc::clone(&stop),
            counters: Arc::clone(&counters),
        };

        let handle = thread::Builder::new()
            .name(format!("capture-{stream_id}"))
            .spawn(move || worker.run())
            .map_err(|e| {
                PipelineError::Startup(format!("Failed to spawn capture thread for {stream_id}: {e}"))
            })?;

        Ok(Self {
            stream_id,
            stop,
            counters,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<CaptureCounters> {
        &self.counters
    }

    /// Ask the loop to exit at its next iteration
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True once the capture thread has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the loop and wait up to `timeout` for it to exit
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ShutdownTimeout` if the thread is still blocked
    /// in its source when the timeout elapses. The thread is detached and
    /// exits on its own once the read returns.
    pub fn join(mut self, timeout: Duration) -> Result<()> {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(stream = %self.stream_id, "Capture did not stop within {:?}, detaching", timeout);
                return Err(PipelineError::ShutdownTimeout {
                    component: format!("capture-{}", self.stream_id),
                    timeout,
                });
            }
            thread::sleep(Duration::from_millis(5));
        }

        if handle.join().is_err() {
            warn!(stream = %self.stream_id, "Capture thread panicked");
        }
        Ok(())
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        self.request_stop();
    }
}

struct CaptureLoop {
    descriptor: StreamDescriptor,
    source: Box<dyn FrameSource>,
    buffer: Arc<RingBuffer<FrameSample>>,
    settings: CaptureSettings,
    stop: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
}

impl CaptureLoop {
    fn frame_interval(&self) -> Duration {
        let fps = self
            .descriptor
            .target_fps
            .or_else(|| self.source.frame_rate())
            .filter(|fps| fps.is_finite() && *fps > 0.0);
        fps.map_or(self.settings.default_frame_interval, |fps| {
            Duration::from_secs_f64(1.0 / fps)
        })
    }

    fn run(mut self) {
        let stream = self.descriptor.id.clone();
        let interval = self.frame_interval();
        info!(stream = %stream, "Capture started ({:?}, interval {:?})", self.descriptor.kind, interval);

        let mut sequence = 0u64;
        while !self.stop.load(Ordering::Acquire) {
            match self.source.read_frame() {
                Ok(ReadOutcome::Frame(image)) => {
                    let sample = FrameSample {
                        stream_id: stream.clone(),
                        sequence,
                        captured_at: Utc::now(),
                        pixels: preprocess(image, &self.descriptor.preprocess),
                    };
                    if let Some(old) = self.buffer.push(sample) {
                        debug!(stream = %stream, "Buffer full, evicted frame {}", old.sequence);
                    }
                    sequence += 1;
                    self.counters.captured.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ReadOutcome::EndOfStream) if !self.descriptor.kind.is_live() => {
                    info!(stream = %stream, "End of stream after {} frames", sequence);
                    break;
                }
                Ok(ReadOutcome::EndOfStream) => {
                    self.read_failed(&stream, "unexpected end of stream".to_string());
                    continue;
                }
                Err(e) => {
                    self.read_failed(&stream, e.to_string());
                    continue;
                }
            }
            sleep_unless_stopped(&self.stop, interval);
        }

        self.source.close();
        info!(stream = %stream, "Capture stopped, source released ({} frames)", sequence);
    }

    fn read_failed(&self, stream: &StreamId, reason: String) {
        let err = PipelineError::SourceRead {
            stream: stream.clone(),
            reason,
        };
        self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
        warn!(stream = %stream, "{}; retrying in {:?}", err, self.settings.read_backoff);
        sleep_unless_stopped(&self.stop, self.settings.read_backoff);
    }
}

/// Sleep for `duration`, returning early once `stop` is raised
pub fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

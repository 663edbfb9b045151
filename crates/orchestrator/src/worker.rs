//! Recognition worker pool
//!
//! A fixed number of worker threads, each owning its own recognizer (the
//! expensive model state) and a bounded input queue. A worker drains its
//! queue strictly in order, so jobs routed to it for one stream are processed
//! in submission order.
//!
//! # Shutdown
//!
//! ```text
//! pool.shutdown()
//!   -> one Shutdown sentinel per queue (behind any queued jobs)
//!   -> wait up to the timeout for every worker to exit
//!   -> stragglers: raise their cancel flag, detach, log force-stop
//!   -> jobs still queued become `abandoned` results
//! ```
//!
//! A worker that panics is reported as crashed through its status; the pool
//! does not restart it. The job it was running becomes a `crashed` result. The dispatcher stops routing to workers that are not
//! running.

use crate::stats::{bump, PipelineStats};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use lipwatch_common::{
    DetectionJob, DetectionResult, FeatureVector, JobError, JobErrorCode, PipelineError, Result, WorkerId,
};
use lipwatch_recognition::{Recognition, RecognitionResult, Recognizer};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Builds the recognizer for one worker, on that worker's thread
pub type RecognizerFactory =
    Arc<dyn Fn(WorkerId) -> RecognitionResult<Box<dyn Recognizer>> + Send + Sync>;

/// Message on a worker's input queue
#[derive(Debug)]
pub enum WorkerMessage {
    Job(DetectionJob),
    /// End of work: the worker exits when it reaches this marker
    Shutdown,
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Stopped,
    /// Recognizer initialization failed; the worker never ran
    Failed,
    /// The worker thread panicked
    Crashed,
}

/// Shared, lock-free view of a worker's state
#[derive(Debug)]
pub struct WorkerStatus(AtomicU8);

impl WorkerStatus {
    fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Stopped,
            3 => WorkerState::Failed,
            _ => WorkerState::Crashed,
        }
    }
}

/// Sending side of a worker's input queue, as seen by the dispatcher
#[derive(Debug, Clone)]
pub struct WorkerQueue {
    pub id: WorkerId,
    pub(crate) sender: Sender<WorkerMessage>,
    pub(crate) status: Arc<WorkerStatus>,
}

impl WorkerQueue {
    /// Create a queue not backed by a worker thread; the receiver is returned
    /// to the caller
    #[must_use]
    pub fn detached(id: WorkerId, capacity: usize) -> (Self, Receiver<WorkerMessage>) {
        let (sender, receiver) = bounded(capacity.max(1));
        let queue = Self {
            id,
            sender,
            status: Arc::new(WorkerStatus::new(WorkerState::Running)),
        };
        (queue, receiver)
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.status.get()
    }

    /// Jobs currently waiting in the queue
    #[must_use]
    pub fn depth(&self) -> usize {
        self.sender.len()
    }
}

/// Pool-wide settings
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub queue_capacity: usize,
    /// Idle wake-up interval for observing cancellation
    pub poll_interval: Duration,
    /// Split jobs into recognizer calls of at most this many features
    pub frame_batch_size: Option<usize>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            poll_interval: Duration::from_secs(1),
            frame_batch_size: None,
        }
    }
}

/// Outcome of [`WorkerPool::shutdown`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolShutdownReport {
    /// Workers that exited on their sentinel within the timeout
    pub stopped: Vec<WorkerId>,
    /// Workers still running at the deadline, detached
    pub force_stopped: Vec<WorkerId>,
    /// Workers found crashed
    pub crashed: Vec<WorkerId>,
    /// Queued jobs reported as abandoned
    pub abandoned: usize,
}

impl PoolShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.force_stopped.is_empty() && self.crashed.is_empty() && self.abandoned == 0
    }
}

struct WorkerHandle {
    queue: WorkerQueue,
    /// Kept to drain jobs the worker will never reach
    receiver: Receiver<WorkerMessage>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Fixed-size pool of recognition workers
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    output: Sender<DetectionResult>,
    stats: Arc<PipelineStats>,
}

impl WorkerPool {
    /// Spawn `size` workers and wait for each to build its recognizer
    ///
    /// Workers whose recognizer fails to initialize are left in the `Failed`
    /// state; the dispatcher treats them as unavailable.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Startup` if no worker could be started.
    pub fn start(
        size: usize,
        factory: RecognizerFactory,
        output: Sender<DetectionResult>,
        settings: WorkerSettings,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let mut ready = Vec::with_capacity(size);

        for index in 0..size {
            let id = WorkerId(index);
            let (sender, receiver) = bounded(settings.queue_capacity.max(1));
            let status = Arc::new(WorkerStatus::new(WorkerState::Starting));
            let cancel = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = bounded::<bool>(1);

            let context = WorkerContext {
                id,
                receiver: receiver.clone(),
                output: output.clone(),
                status: Arc::clone(&status),
                cancel: Arc::clone(&cancel),
                settings,
            };
            let factory = Arc::clone(&factory);

            let thread = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || context.run(&factory, &ready_tx));

            let thread = match thread {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!(worker = %id, "Failed to spawn worker thread: {}", e);
                    status.set(WorkerState::Failed);
                    None
                }
            };

            ready.push(ready_rx);
            workers.push(WorkerHandle {
                queue: WorkerQueue { id, sender, status },
                receiver,
                cancel,
                thread,
            });
        }

        // A dropped sender (spawn failure, panic during init) reads as not ready
        let started = ready
            .iter()
            .filter(|rx| rx.recv().unwrap_or(false))
            .count();

        let pool = Self {
            workers,
            output,
            stats,
        };

        if started == 0 {
            pool.shutdown(Duration::from_millis(100));
            return Err(PipelineError::Startup(format!(
                "none of the {size} recognition workers could be started"
            )));
        }
        if started < size {
            warn!("Only {}/{} recognition workers started", started, size);
        } else {
            info!("Started {} recognition workers", size);
        }
        Ok(pool)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue handles, indexed by worker id
    #[must_use]
    pub fn queues(&self) -> Vec<WorkerQueue> {
        self.workers.iter().map(|w| w.queue.clone()).collect()
    }

    /// Current state of every worker
    #[must_use]
    pub fn health(&self) -> Vec<(WorkerId, WorkerState)> {
        self.workers
            .iter()
            .map(|w| (w.queue.id, w.queue.state()))
            .collect()
    }

    /// Jobs waiting in each worker's queue
    #[must_use]
    pub fn queue_depths(&self) -> Vec<(WorkerId, usize)> {
        self.workers
            .iter()
            .map(|w| (w.queue.id, w.receiver.len()))
            .collect()
    }

    /// Stop every worker, waiting at most `timeout`
    ///
    /// Jobs queued before this call are still processed if the workers reach
    /// their sentinels in time. Anything left in a queue afterwards is
    /// reported as an abandoned result on the output queue.
    pub fn shutdown(mut self, timeout: Duration) -> PoolShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut report = PoolShutdownReport::default();

        // Full queues get their sentinel as soon as a slot frees up
        let mut pending: Vec<usize> = (0..self.workers.len()).collect();
        let send_sentinels = |pending: &mut Vec<usize>, workers: &[WorkerHandle]| {
            pending.retain(|&index| {
                matches!(
                    workers[index].queue.sender.try_send(WorkerMessage::Shutdown),
                    Err(TrySendError::Full(_))
                )
            });
        };
        send_sentinels(&mut pending, &self.workers);

        while Instant::now() < deadline
            && self
                .workers
                .iter()
                .any(|w| w.thread.as_ref().is_some_and(|t| !t.is_finished()))
        {
            thread::sleep(Duration::from_millis(5));
            send_sentinels(&mut pending, &self.workers);
        }

        for worker in &mut self.workers {
            let id = worker.queue.id;
            match worker.thread.take() {
                Some(handle) if !handle.is_finished() => {
                    worker.cancel.store(true, Ordering::Release);
                    let err = PipelineError::ShutdownTimeout {
                        component: id.to_string(),
                        timeout,
                    };
                    error!(worker = %id, "{}; force-stopped", err);
                    bump(&self.stats.workers_force_stopped);
                    report.force_stopped.push(id);
                }
                Some(handle) => {
                    if handle.join().is_err() || worker.queue.state() == WorkerState::Crashed {
                        bump(&self.stats.workers_crashed);
                        report.crashed.push(id);
                    } else {
                        report.stopped.push(id);
                    }
                }
                None => {}
            }

            while let Ok(message) = worker.receiver.try_recv() {
                if let WorkerMessage::Job(job) = message {
                    abandon(&self.output, id, &job);
                    report.abandoned += 1;
                }
            }
        }

        info!(
            "Worker pool stopped: {} clean, {} force-stopped, {} crashed, {} abandoned jobs",
            report.stopped.len(),
            report.force_stopped.len(),
            report.crashed.len(),
            report.abandoned
        );
        report
    }
}

fn abandon(output: &Sender<DetectionResult>, worker: WorkerId, job: &DetectionJob) {
    warn!(worker = %worker, stream = %job.stream_id, "Job {} abandoned at shutdown", job.correlation_id);
    let result = DetectionResult::failure(
        job,
        worker,
        JobError::new(JobErrorCode::Abandoned, format!("{worker} stopped before the job ran")),
        Duration::ZERO,
    );
    if output.send(result).is_err() {
        warn!("Result queue closed; abandoned job {} not reported", job.correlation_id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Everything a worker thread owns
struct WorkerContext {
    id: WorkerId,
    receiver: Receiver<WorkerMessage>,
    output: Sender<DetectionResult>,
    status: Arc<WorkerStatus>,
    cancel: Arc<AtomicBool>,
    settings: WorkerSettings,
}

/// Marks the worker stopped on exit, or crashed when unwinding from a panic
struct ExitGuard {
    id: WorkerId,
    status: Arc<WorkerStatus>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.status.set(WorkerState::Crashed);
            error!(worker = %self.id, "{}; it will not be restarted", PipelineError::WorkerCrash { worker: self.id });
        } else if self.status.get() == WorkerState::Running {
            self.status.set(WorkerState::Stopped);
        }
    }
}

impl WorkerContext {
    fn run(self, factory: &RecognizerFactory, ready: &Sender<bool>) {
        let guard = ExitGuard {
            id: self.id,
            status: Arc::clone(&self.status),
        };

        let mut recognizer = match factory(self.id) {
            Ok(recognizer) => recognizer,
            Err(e) => {
                error!(worker = %self.id, "Recognizer initialization failed: {}", e);
                self.status.set(WorkerState::Failed);
                let _ = ready.send(false);
                return;
            }
        };
        self.status.set(WorkerState::Running);
        let _ = ready.send(true);
        info!(worker = %self.id, "Worker started");

        let mut processed = 0u64;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                warn!(worker = %self.id, "Worker cancelled");
                break;
            }
            match self.receiver.recv_timeout(self.settings.poll_interval) {
                Ok(WorkerMessage::Job(job)) => {
                    let started = Instant::now();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(recognizer.as_mut(), &job)));
                    if let Err(payload) = outcome {
                        self.report_crash(&job, panic_message(payload.as_ref()), started.elapsed());
                        panic::resume_unwind(payload);
                    }
                    processed += 1;
                }
                Ok(WorkerMessage::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(guard);
        info!(worker = %self.id, "Worker stopped after {} jobs", processed);
    }

    /// Report the job that was running when the recognizer panicked
    fn report_crash(&self, job: &DetectionJob, reason: &str, latency: Duration) {
        error!(worker = %self.id, stream = %job.stream_id, "Job {} crashed the worker: {}", job.correlation_id, reason);
        let result = DetectionResult::failure(
            job,
            self.id,
            JobError::new(JobErrorCode::Crashed, format!("{} panicked: {reason}", self.id)),
            latency,
        );
        if self.output.send(result).is_err() {
            warn!(worker = %self.id, "Result queue closed; crashed job {} not reported", job.correlation_id);
        }
    }

    fn process(&self, recognizer: &mut dyn Recognizer, job: &DetectionJob) {
        let started = Instant::now();
        let outcome = predict_in_chunks(recognizer, &job.batch, self.settings.frame_batch_size);
        let latency = started.elapsed();

        let result = match outcome {
            Ok(recognition) => {
                debug!(
                    worker = %self.id,
                    stream = %job.stream_id,
                    "Job {} recognized {:?} ({:.2}) in {:?}",
                    job.correlation_id,
                    recognition.text,
                    recognition.confidence,
                    latency
                );
                DetectionResult::success(job, self.id, recognition.text, recognition.confidence, latency)
            }
            Err(e) => {
                let err = PipelineError::WorkerInference {
                    attempts: e.attempts(),
                    reason: e.to_string(),
                };
                warn!(worker = %self.id, stream = %job.stream_id, "Job {} failed: {}", job.correlation_id, err);
                DetectionResult::failure(job, self.id, JobError::new(JobErrorCode::Inference, e.to_string()), latency)
            }
        };

        if self.output.send(result).is_err() {
            warn!(worker = %self.id, "Result queue closed; dropping result of job {}", job.correlation_id);
        }
    }
}

/// Run the recognizer over `batch`, split into chunks of `chunk_size`
///
/// Chunk texts are joined with a space (empty ones skipped); the confidence
/// is the mean weighted by chunk length.
///
/// # Errors
///
/// Returns the first chunk error.
pub fn predict_in_chunks(
    recognizer: &mut dyn Recognizer,
    batch: &[FeatureVector],
    chunk_size: Option<usize>,
) -> RecognitionResult<Recognition> {
    let chunk_size = match chunk_size {
        Some(n) if n > 0 && n < batch.len() => n,
        _ => return recognizer.predict(batch),
    };

    let mut texts = Vec::new();
    let mut weighted = 0.0f32;
    for chunk in batch.chunks(chunk_size) {
        let recognition = recognizer.predict(chunk)?;
        weighted += recognition.confidence * chunk.len() as f32;
        if !recognition.text.is_empty() {
            texts.push(recognition.text);
        }
    }

    Ok(Recognition {
        text: texts.join(" "),
        confidence: weighted / batch.len() as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use lipwatch_common::StreamId;
    use lipwatch_recognition::RecognitionError;

    fn features(n: usize) -> Vec<FeatureVector> {
        (0..n).map(|i| FeatureVector::new(vec![i as f32], 0.9)).collect()
    }

    fn job(n: usize) -> DetectionJob {
        DetectionJob::new(StreamId::new("cam"), "hall", features(n), 0, n as u64)
    }

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            queue_capacity: 4,
            poll_interval: Duration::from_millis(10),
            frame_batch_size: None,
        }
    }

    fn echo_factory() -> RecognizerFactory {
        Arc::new(|id: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> {
            Ok(Box::new(move |batch: &[FeatureVector]| -> RecognitionResult<Recognition> {
                Ok(Recognition::new(format!("{id}:{}", batch.len()), 0.5))
            }))
        })
    }

    #[test]
    fn test_chunked_prediction_merges_text_and_confidence() {
        let mut recognizer = |batch: &[FeatureVector]| -> RecognitionResult<Recognition> {
            let text = if batch.len() == 1 { String::new() } else { format!("w{}", batch.len()) };
            Ok(Recognition::new(text, batch.len() as f32 / 10.0))
        };

        let merged = predict_in_chunks(&mut recognizer, &features(5), Some(2)).unwrap();
        // Chunks of 2, 2, 1
        assert_eq!(merged.text, "w2 w2");
        let expected = (0.2 * 2.0 + 0.2 * 2.0 + 0.1 * 1.0) / 5.0;
        assert!((merged.confidence - expected).abs() < 1e-6);

        let whole = predict_in_chunks(&mut recognizer, &features(5), Some(10)).unwrap();
        assert_eq!(whole.text, "w5");
    }

    #[test]
    fn test_chunk_error_fails_the_job() {
        let mut calls = 0;
        let mut recognizer = |_: &[FeatureVector]| -> RecognitionResult<Recognition> {
            calls += 1;
            if calls == 2 {
                Err(RecognitionError::Timeout(Duration::from_secs(1)))
            } else {
                Ok(Recognition::new("x", 1.0))
            }
        };
        assert!(predict_in_chunks(&mut recognizer, &features(6), Some(2)).is_err());
    }

    #[test]
    fn test_pool_processes_jobs_and_stops_cleanly() {
        let (out_tx, out_rx) = unbounded();
        let stats = Arc::new(PipelineStats::new());
        let pool = WorkerPool::start(2, echo_factory(), out_tx, fast_settings(), stats).unwrap();

        assert_eq!(pool.size(), 2);
        assert!(pool.health().iter().all(|(_, s)| *s == WorkerState::Running));

        let queues = pool.queues();
        queues[1].sender.send(WorkerMessage::Job(job(3))).unwrap();
        let result = out_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_success());
        assert_eq!(result.worker, WorkerId(1));
        assert_eq!(result.text, "worker-1:3");

        let report = pool.shutdown(Duration::from_secs(5));
        assert!(report.is_clean());
        assert_eq!(report.stopped.len(), 2);
        assert!(queues.iter().all(|q| q.state() == WorkerState::Stopped));
    }

    #[test]
    fn test_no_worker_starts_is_fatal() {
        let (out_tx, _out_rx) = unbounded();
        let factory: RecognizerFactory = Arc::new(|_: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> {
            Err(RecognitionError::Other("model missing".into()))
        });
        let result = WorkerPool::start(3, factory, out_tx, fast_settings(), Arc::new(PipelineStats::new()));
        assert!(matches!(result, Err(PipelineError::Startup(_))));
    }

    #[test]
    fn test_partial_start_marks_failed_workers() {
        let (out_tx, _out_rx) = unbounded();
        let factory: RecognizerFactory = Arc::new(|id: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> {
            if id.0 == 0 {
                return Err(RecognitionError::Other("no GPU".into()));
            }
            Ok(Box::new(|_: &[FeatureVector]| -> RecognitionResult<Recognition> {
                Ok(Recognition::new("", 0.0))
            }))
        });

        let pool = WorkerPool::start(2, factory, out_tx, fast_settings(), Arc::new(PipelineStats::new())).unwrap();
        let health = pool.health();
        assert_eq!(health[0], (WorkerId(0), WorkerState::Failed));
        assert_eq!(health[1], (WorkerId(1), WorkerState::Running));
        pool.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn test_panicking_recognizer_marks_worker_crashed() {
        let (out_tx, out_rx) = unbounded();
        let factory: RecognizerFactory = Arc::new(|_: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> {
            Ok(Box::new(|_: &[FeatureVector]| -> RecognitionResult<Recognition> {
                panic!("model state corrupted")
            }))
        });
        let pool = WorkerPool::start(1, factory, out_tx, fast_settings(), Arc::new(PipelineStats::new())).unwrap();
        let queue = pool.queues().remove(0);
        let running = job(2);
        let running_id = running.correlation_id;
        queue.sender.send(WorkerMessage::Job(running)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.state() != WorkerState::Crashed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.state(), WorkerState::Crashed);

        // Queued behind the crash: never processed, reported as abandoned
        let queued = job(2);
        let queued_id = queued.correlation_id;
        queue.sender.send(WorkerMessage::Job(queued)).unwrap();
        let report = pool.shutdown(Duration::from_millis(200));
        assert_eq!(report.crashed, vec![WorkerId(0)]);
        assert_eq!(report.abandoned, 1);

        // Both accepted jobs yield a result
        let codes: Vec<_> = out_rx
            .try_iter()
            .map(|r| (r.correlation_id, r.error.map(|e| e.code)))
            .collect();
        assert_eq!(
            codes,
            vec![
                (running_id, Some(JobErrorCode::Crashed)),
                (queued_id, Some(JobErrorCode::Abandoned)),
            ]
        );
    }

    #[test]
    fn test_full_queue_does_not_starve_other_workers_at_shutdown() {
        let (out_tx, _out_rx) = unbounded();
        let factory: RecognizerFactory = Arc::new(|id: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> {
            let delay = if id.0 == 0 { Duration::from_millis(500) } else { Duration::ZERO };
            Ok(Box::new(move |_: &[FeatureVector]| -> RecognitionResult<Recognition> {
                thread::sleep(delay);
                Ok(Recognition::new("", 0.5))
            }))
        });
        let settings = WorkerSettings {
            queue_capacity: 2,
            ..fast_settings()
        };
        let pool = WorkerPool::start(2, factory, out_tx, settings, Arc::new(PipelineStats::new())).unwrap();
        let busy = pool.queues().remove(0);

        // One job in flight, two more filling the queue
        busy.sender.send(WorkerMessage::Job(job(1))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while busy.depth() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        busy.sender.send(WorkerMessage::Job(job(1))).unwrap();
        busy.sender.send(WorkerMessage::Job(job(1))).unwrap();

        let report = pool.shutdown(Duration::from_millis(150));
        assert_eq!(report.stopped, vec![WorkerId(1)]);
        assert_eq!(report.force_stopped, vec![WorkerId(0)]);
        assert_eq!(report.abandoned, 2);
    }
}

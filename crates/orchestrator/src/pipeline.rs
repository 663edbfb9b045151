//! Pipeline assembly and the start/stop protocol
//!
//! # Start
//!
//! 1. Open every enabled stream's source; streams that fail to open are
//!    logged and skipped. No open stream is fatal.
//! 2. Start the result collector, then the worker pool. No running worker is
//!    fatal.
//! 3. Build the dispatcher's stream-to-worker table once, for the opened
//!    streams only.
//! 4. Per stream: ring buffer, analysis thread, capture thread.
//! 5. Optional queue monitor.
//!
//! # Stop
//!
//! ```text
//! monitor -> captures (bounded join) -> analyzers -> clear ring buffers
//!         -> worker pool (sentinels, bounded wait, force-stop)
//!         -> collector (drain until empty or timeout) -> summary
//! ```

use crate::analyzer::StreamAnalyzer;
use crate::assembler::SequenceAssembler;
use crate::collector::ResultCollector;
use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::monitor::{DepthProbe, QueueDepths, QueueMonitor};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::worker::{PoolShutdownReport, RecognizerFactory, WorkerPool, WorkerSettings, WorkerState};
use crossbeam_channel::{unbounded, Receiver};
use lipwatch_common::{
    DetectionResult, FrameSample, PipelineError, Result, StreamDescriptor, StreamId, WorkerId,
};
use lipwatch_features::{roi_factory, ExtractorFactory};
use lipwatch_ingestion::{
    CaptureCounters, DefaultSourceOpener, FrameSource, RingBuffer, SourceOpener, StreamCapture,
};
use lipwatch_recognition::{RecognitionResult, Recognizer, RecognizerConfig};
use lipwatch_storage::{JsonLinesStore, LogPublisher, MemorySink, PersistenceSink, PublicationSink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Collaborators the pipeline is built from
#[derive(Clone)]
pub struct PipelineComponents {
    pub opener: Arc<dyn SourceOpener>,
    pub extractors: ExtractorFactory,
    pub recognizers: RecognizerFactory,
    pub persistence: Arc<dyn PersistenceSink>,
    pub publication: Arc<dyn PublicationSink>,
}

impl PipelineComponents {
    /// Built-in collaborators described by `config`
    ///
    /// Records go to the configured JSON-lines file, or stay in memory when
    /// none is set. Publication is a structured log event.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Startup` if the JSON-lines file cannot be opened.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let persistence: Arc<dyn PersistenceSink> = match &config.storage.jsonl_path {
            Some(path) => Arc::new(JsonLinesStore::open(path).map_err(|e| {
                PipelineError::Startup(format!("cannot open {}: {e}", path.display()))
            })?),
            None => Arc::new(MemorySink::new()),
        };

        Ok(Self {
            opener: Arc::new(DefaultSourceOpener),
            extractors: roi_factory(config.extractor.clone()),
            recognizers: recognizer_factory(config.recognizer.clone()),
            persistence,
            publication: Arc::new(LogPublisher::new()),
        })
    }
}

/// One HTTP recognizer per worker, built from `config`
#[must_use]
pub fn recognizer_factory(config: RecognizerConfig) -> RecognizerFactory {
    Arc::new(move |_: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> { config.build() })
}

/// Outcome of [`Pipeline::shutdown`]
#[derive(Debug, Clone)]
pub struct ShutdownSummary {
    pub stats: StatsSnapshot,
    pub pool: PoolShutdownReport,
    /// Components that missed their stop deadline and were detached
    pub timed_out: Vec<String>,
    /// Results still queued when the collector gave up
    pub undrained: usize,
}

impl ShutdownSummary {
    /// Everything stopped in time and every result was delivered
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.undrained == 0 && self.pool.force_stopped.is_empty()
    }
}

struct StreamRuntime {
    id: StreamId,
    buffer: Arc<RingBuffer<FrameSample>>,
    counters: Arc<CaptureCounters>,
    capture: Option<StreamCapture>,
    analyzer: Option<StreamAnalyzer>,
}

/// A running pipeline
///
/// Dropping it runs the same stop protocol as [`Pipeline::shutdown`].
pub struct Pipeline {
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    streams: Vec<StreamRuntime>,
    pool: Option<WorkerPool>,
    collector: Option<ResultCollector>,
    monitor: Option<QueueMonitor>,
    stopped: bool,
}

impl Pipeline {
    /// Validate `config` and start every component
    ///
    /// # Errors
    ///
    /// - `PipelineError::InvalidConfig` if the configuration is invalid
    /// - `PipelineError::Startup` if no stream could be opened or no worker
    ///   could be started
    pub fn start(config: PipelineConfig, components: PipelineComponents) -> Result<Self> {
        config.validate()?;

        let opened = open_sources(&config, components.opener.as_ref())?;
        let stats = Arc::new(PipelineStats::new());
        let (output, results) = unbounded::<DetectionResult>();

        let collector = ResultCollector::start(
            results.clone(),
            components.persistence,
            components.publication,
            Arc::clone(&stats),
            config.worker_poll_interval(),
        )?;

        let settings = WorkerSettings {
            queue_capacity: config.worker_queue_capacity,
            poll_interval: config.worker_poll_interval(),
            frame_batch_size: config.frame_batch_size,
        };
        let pool = WorkerPool::start(
            config.max_workers,
            components.recognizers,
            output,
            settings,
            Arc::clone(&stats),
        )?;

        let dispatcher = Arc::new(Dispatcher::new(
            pool.queues(),
            opened.iter().map(|(descriptor, _)| descriptor.id.clone()),
            Arc::clone(&stats),
        ));
        for (stream, worker) in dispatcher.assignments() {
            info!(stream = %stream, "Routed to {}", worker);
        }

        let mut pipeline = Self {
            config,
            stats,
            streams: Vec::with_capacity(opened.len()),
            pool: Some(pool),
            collector: Some(collector),
            monitor: None,
            stopped: false,
        };

        // From here on, an error drops `pipeline`, which stops what already runs
        for (descriptor, source) in opened {
            pipeline.start_stream(descriptor, source, &dispatcher, &components.extractors)?;
        }

        if let Some(interval) = pipeline.config.monitor_interval() {
            let probe = pipeline.depth_probe(results);
            pipeline.monitor = Some(QueueMonitor::start(probe, interval)?);
        }

        info!(
            "Pipeline started: {} streams, {} workers",
            pipeline.streams.len(),
            pipeline.pool.as_ref().map_or(0, WorkerPool::size)
        );
        Ok(pipeline)
    }

    fn start_stream(
        &mut self,
        descriptor: StreamDescriptor,
        source: Box<dyn FrameSource>,
        dispatcher: &Arc<Dispatcher>,
        extractors: &ExtractorFactory,
    ) -> Result<()> {
        let id = descriptor.id.clone();
        let buffer = Arc::new(RingBuffer::new(self.config.buffer_size));

        let assembler = SequenceAssembler::new(
            id.clone(),
            descriptor.location.clone(),
            self.config.window_size,
            self.config.confidence_threshold,
        );
        let analyzer = StreamAnalyzer::start(
            Arc::clone(&buffer),
            extractors(&descriptor),
            assembler,
            Arc::clone(dispatcher),
            Arc::clone(&self.stats),
        )?;
        let capture = StreamCapture::start(descriptor, source, Arc::clone(&buffer), self.config.capture_settings())?;

        self.streams.push(StreamRuntime {
            id,
            buffer,
            counters: Arc::clone(capture.counters()),
            capture: Some(capture),
            analyzer: Some(analyzer),
        });
        Ok(())
    }

    fn depth_probe(&self, results: Receiver<DetectionResult>) -> DepthProbe {
        let queues = self.pool.as_ref().map(WorkerPool::queues).unwrap_or_default();
        let buffers: Vec<(StreamId, Arc<RingBuffer<FrameSample>>)> = self
            .streams
            .iter()
            .map(|s| (s.id.clone(), Arc::clone(&s.buffer)))
            .collect();

        Box::new(move || QueueDepths {
            workers: queues.iter().map(|q| (q.id, q.depth())).collect(),
            output: results.len(),
            buffers: buffers.iter().map(|(id, b)| (id.clone(), b.len())).collect(),
        })
    }

    /// Current counters, capture side included
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        for stream in &self.streams {
            snapshot.frames_captured += stream.counters.captured();
            snapshot.read_failures += stream.counters.read_failures();
            snapshot.frames_evicted += stream.buffer.evicted();
        }
        snapshot
    }

    /// Up to `n` most recent frames of `stream_id`, oldest first, without
    /// consuming them
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UnknownStream` if the stream is not running.
    pub fn recent_frames(&self, stream_id: &StreamId, n: usize) -> Result<Vec<FrameSample>> {
        self.streams
            .iter()
            .find(|s| &s.id == stream_id)
            .map(|s| s.buffer.latest(n))
            .ok_or_else(|| PipelineError::UnknownStream(stream_id.clone()))
    }

    /// Ids of the streams that were opened
    #[must_use]
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|s| s.id.clone()).collect()
    }

    #[must_use]
    pub fn worker_health(&self) -> Vec<(WorkerId, WorkerState)> {
        self.pool.as_ref().map(WorkerPool::health).unwrap_or_default()
    }

    /// True once every capture loop has ended (file streams at end-of-stream)
    #[must_use]
    pub fn captures_finished(&self) -> bool {
        self.streams
            .iter()
            .all(|s| s.capture.as_ref().map_or(true, StreamCapture::is_finished))
    }

    /// True once every capture has ended and every captured frame was analyzed
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.captures_finished() && self.streams.iter().all(|s| s.buffer.is_empty())
    }

    /// Run the stop protocol and report how it went
    pub fn shutdown(mut self) -> ShutdownSummary {
        self.stop()
    }

    fn stop(&mut self) -> ShutdownSummary {
        self.stopped = true;
        info!("Stopping pipeline");
        let mut timed_out = Vec::new();

        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }

        for stream in &self.streams {
            if let Some(capture) = &stream.capture {
                capture.request_stop();
            }
        }
        let deadline = Instant::now() + self.config.capture_join_timeout();
        for stream in &mut self.streams {
            if let Some(capture) = stream.capture.take() {
                if let Err(e) = capture.join(remaining(deadline)) {
                    warn!(stream = %stream.id, "{}", e);
                    timed_out.push(format!("capture-{}", stream.id));
                }
            }
        }

        for stream in &self.streams {
            if let Some(analyzer) = &stream.analyzer {
                analyzer.request_stop();
            }
        }
        let deadline = Instant::now() + self.config.capture_join_timeout();
        for stream in &mut self.streams {
            if let Some(analyzer) = stream.analyzer.take() {
                if let Err(e) = analyzer.join(remaining(deadline)) {
                    warn!(stream = %stream.id, "{}", e);
                    timed_out.push(format!("analyze-{}", stream.id));
                }
            }
            stream.buffer.clear();
        }

        let pool = match self.pool.take() {
            Some(pool) => pool.shutdown(self.config.shutdown_timeout()),
            None => PoolShutdownReport::default(),
        };
        timed_out.extend(pool.force_stopped.iter().map(ToString::to_string));

        let undrained = match self.collector.take() {
            Some(collector) => collector.finish(self.config.collector_drain_timeout()),
            None => 0,
        };
        if undrained > 0 {
            timed_out.push("collector".to_string());
        }

        let summary = ShutdownSummary {
            stats: self.stats(),
            pool,
            timed_out,
            undrained,
        };
        if summary.is_clean() {
            info!(
                "Pipeline stopped: {} jobs dispatched, {} dropped, {} results, {} sink failures",
                summary.stats.jobs_dispatched,
                summary.stats.jobs_dropped_queue_full + summary.stats.jobs_dropped_unavailable,
                summary.stats.results_total(),
                summary.stats.sink_failures
            );
        } else {
            error!(
                "Pipeline stopped with timeouts: {:?}; {} results undelivered",
                summary.timed_out, summary.undrained
            );
        }
        summary
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.stopped {
            self.stop();
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn open_sources(
    config: &PipelineConfig,
    opener: &dyn SourceOpener,
) -> Result<Vec<(StreamDescriptor, Box<dyn FrameSource>)>> {
    let mut opened = Vec::new();
    for descriptor in config.enabled_streams() {
        match opener.open(descriptor) {
            Ok(source) => {
                info!(stream = %descriptor.id, "Opened {:?} source {}", descriptor.kind, descriptor.locator);
                opened.push((descriptor.clone(), source));
            }
            Err(e) => error!(stream = %descriptor.id, "{}", e),
        }
    }

    if opened.is_empty() {
        return Err(PipelineError::Startup(
            "no stream source could be opened".to_string(),
        ));
    }
    Ok(opened)
}

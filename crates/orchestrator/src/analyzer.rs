//! Per-stream analysis loop
//!
//! Consumes a stream's ring buffer oldest-first, runs the stream's feature
//! extractor on each frame, feeds the features to the stream's
//! [`SequenceAssembler`] and submits every emitted job to the dispatcher.
//! The assembler is owned by this thread alone.

use crate::assembler::SequenceAssembler;
use crate::dispatcher::Dispatcher;
use crate::stats::{bump, PipelineStats};
use lipwatch_common::{Extraction, FrameSample, PipelineError, Result, StreamId};
use lipwatch_features::FeatureExtractor;
use lipwatch_ingestion::capture::sleep_unless_stopped;
use lipwatch_ingestion::RingBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause when the ring buffer is empty
const IDLE_WAIT: Duration = Duration::from_millis(5);

pub struct StreamAnalyzer {
    stream_id: StreamId,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamAnalyzer {
    /// Spawn the `analyze-<stream>` thread
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Startup` if the thread cannot be spawned.
    pub fn start(
        buffer: Arc<RingBuffer<FrameSample>>,
        extractor: Box<dyn FeatureExtractor>,
        assembler: SequenceAssembler,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let stream_id = assembler.stream_id().clone();
        let stop = Arc::new(AtomicBool::new(false));

        let analysis = AnalysisLoop {
            stream_id: stream_id.clone(),
            buffer,
            extractor,
            assembler,
            dispatcher,
            stats,
            stop: Arc::clone(&stop),
        };

        let handle = thread::Builder::new()
            .name(format!("analyze-{stream_id}"))
            .spawn(move || analysis.run())
            .map_err(|e| PipelineError::Startup(format!("Failed to spawn analysis thread for {stream_id}: {e}")))?;

        Ok(Self {
            stream_id,
            stop,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the loop and wait up to `timeout`
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ShutdownTimeout` if the extractor is still busy
    /// at the deadline; the thread is detached.
    pub fn join(mut self, timeout: Duration) -> Result<()> {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(stream = %self.stream_id, "Analysis did not stop within {:?}, detaching", timeout);
                return Err(PipelineError::ShutdownTimeout {
                    component: format!("analyze-{}", self.stream_id),
                    timeout,
                });
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            warn!(stream = %self.stream_id, "Analysis thread panicked");
        }
        Ok(())
    }
}

impl Drop for StreamAnalyzer {
    fn drop(&mut self) {
        self.request_stop();
    }
}

struct AnalysisLoop {
    stream_id: StreamId,
    buffer: Arc<RingBuffer<FrameSample>>,
    extractor: Box<dyn FeatureExtractor>,
    assembler: SequenceAssembler,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PipelineStats>,
    stop: Arc<AtomicBool>,
}

impl AnalysisLoop {
    fn run(mut self) {
        debug!(stream = %self.stream_id, "Analysis started");
        while !self.stop.load(Ordering::Acquire) {
            match self.buffer.pop_oldest() {
                Some(frame) => self.analyze(&frame),
                None => sleep_unless_stopped(&self.stop, IDLE_WAIT),
            }
        }
        info!(
            stream = %self.stream_id,
            "Analysis stopped: {} gate evaluations, {} jobs emitted",
            self.assembler.evaluations(),
            self.assembler.emitted()
        );
    }

    fn analyze(&mut self, frame: &FrameSample) {
        bump(&self.stats.frames_analyzed);
        let feature = match self.extractor.extract(frame) {
            Extraction::Feature(feature) => feature,
            Extraction::NoDetection => {
                bump(&self.stats.no_detections);
                return;
            }
        };

        if let Some(job) = self.assembler.push(frame.sequence, feature) {
            // Drops are counted and logged by the dispatcher
            if let Err(e) = self.dispatcher.submit(job) {
                debug!(stream = %self.stream_id, "Job not dispatched: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerMessage, WorkerQueue};
    use chrono::Utc;
    use lipwatch_common::{FeatureVector, FramePixels, WorkerId};

    fn frame(sequence: u64) -> FrameSample {
        FrameSample {
            stream_id: StreamId::new("cam"),
            sequence,
            captured_at: Utc::now(),
            pixels: FramePixels::Luma(image::GrayImage::new(2, 2)),
        }
    }

    #[test]
    fn test_analysis_feeds_assembler_and_dispatches() {
        let stats = Arc::new(PipelineStats::new());
        let (queue, rx) = WorkerQueue::detached(WorkerId(0), 8);
        let dispatcher = Arc::new(Dispatcher::new(vec![queue], [StreamId::new("cam")], Arc::clone(&stats)));

        let buffer = Arc::new(RingBuffer::new(16));
        for seq in 0..5 {
            buffer.push(frame(seq));
        }

        // Odd frames hold nothing usable
        let extractor = |f: &FrameSample| {
            if f.sequence % 2 == 1 {
                Extraction::NoDetection
            } else {
                Extraction::Feature(FeatureVector::new(vec![f.sequence as f32], 0.9))
            }
        };
        let assembler = SequenceAssembler::new(StreamId::new("cam"), "hall", 2, 0.5);
        let analyzer =
            StreamAnalyzer::start(Arc::clone(&buffer), Box::new(extractor), assembler, dispatcher, Arc::clone(&stats))
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.snapshot().frames_analyzed < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        analyzer.join(Duration::from_secs(5)).unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_analyzed, 5);
        assert_eq!(snapshot.no_detections, 2);
        // Features from frames 0, 2, 4: windows [0,2] and [2,4]
        let jobs: Vec<(u64, u64)> = rx
            .try_iter()
            .filter_map(|m| match m {
                WorkerMessage::Job(job) => Some((job.first_sequence, job.last_sequence)),
                WorkerMessage::Shutdown => None,
            })
            .collect();
        assert_eq!(jobs, vec![(0, 2), (2, 4)]);
        assert!(buffer.is_empty());
    }
}

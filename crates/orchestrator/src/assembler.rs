//! Sliding feature window and detection gate
//!
//! One assembler per stream, owned by that stream's analysis thread. Each
//! feature is appended to the window; once the window holds `window_size`
//! features the gate is evaluated on every push:
//!
//! ```text
//! FILLING --(full && latest confidence > threshold)--> READY --emit job--> FILLING
//! ```
//!
//! The window is never cleared after a job is emitted. It keeps sliding, so
//! a sustained high-quality signal produces one job per new feature.

use lipwatch_common::{DetectionJob, FeatureVector, StreamId};
use std::collections::VecDeque;

/// Gate state of an assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Filling,
    Ready,
}

#[derive(Debug)]
pub struct SequenceAssembler {
    stream_id: StreamId,
    location: String,
    window_size: usize,
    confidence_threshold: f32,
    /// (frame sequence number, feature), oldest first
    window: VecDeque<(u64, FeatureVector)>,
    state: AssemblerState,
    evaluations: u64,
    emitted: u64,
}

impl SequenceAssembler {
    pub fn new(
        stream_id: StreamId,
        location: impl Into<String>,
        window_size: usize,
        confidence_threshold: f32,
    ) -> Self {
        let window_size = window_size.max(1);
        Self {
            stream_id,
            location: location.into(),
            window_size,
            confidence_threshold,
            window: VecDeque::with_capacity(window_size + 1),
            state: AssemblerState::Filling,
            evaluations: 0,
            emitted: 0,
        }
    }

    /// Append the feature extracted from frame `sequence` and evaluate the gate
    ///
    /// Returns the job to dispatch when the gate fires. The job carries a copy
    /// of the whole window in arrival order.
    pub fn push(&mut self, sequence: u64, feature: FeatureVector) -> Option<DetectionJob> {
        let confidence = feature.confidence;
        self.window.push_back((sequence, feature));
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }

        if self.is_full() {
            self.evaluations += 1;
            if confidence > self.confidence_threshold {
                self.state = AssemblerState::Ready;
            }
        }
        self.take_ready_job()
    }

    fn take_ready_job(&mut self) -> Option<DetectionJob> {
        if self.state != AssemblerState::Ready {
            return None;
        }
        self.state = AssemblerState::Filling;

        let first = self.window.front().map_or(0, |(seq, _)| *seq);
        let last = self.window.back().map_or(0, |(seq, _)| *seq);
        let batch: Vec<FeatureVector> = self.window.iter().map(|(_, f)| f.clone()).collect();
        self.emitted += 1;

        Some(DetectionJob::new(
            self.stream_id.clone(),
            self.location.clone(),
            batch,
            first,
            last,
        ))
    }

    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    #[must_use]
    pub fn state(&self) -> AssemblerState {
        self.state
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.window.len() == self.window_size
    }

    #[must_use]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Gate evaluations so far (one per push once the window is full)
    #[must_use]
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Jobs emitted so far
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Frame sequence numbers currently in the window, oldest first
    #[must_use]
    pub fn window_sequences(&self) -> Vec<u64> {
        self.window.iter().map(|(seq, _)| *seq).collect()
    }

    /// Drop all buffered features
    pub fn reset(&mut self) {
        self.window.clear();
        self.state = AssemblerState::Filling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(tag: f32, confidence: f32) -> FeatureVector {
        FeatureVector::new(vec![tag], confidence)
    }

    fn tags(job: &DetectionJob) -> Vec<f32> {
        job.batch.iter().map(|f| f.values[0]).collect()
    }

    #[test]
    fn test_window_slides_one_evaluation_per_push() {
        let mut assembler = SequenceAssembler::new(StreamId::new("s"), "hall", 3, 0.0);
        let mut jobs = Vec::new();
        for i in 1..=5u64 {
            if let Some(job) = assembler.push(i, feature(i as f32, 0.9)) {
                jobs.push(job);
            }
        }

        assert_eq!(assembler.evaluations(), 3);
        assert_eq!(jobs.len(), 3);
        assert_eq!(tags(&jobs[0]), vec![1.0, 2.0, 3.0]);
        assert_eq!(tags(&jobs[1]), vec![2.0, 3.0, 4.0]);
        assert_eq!(tags(&jobs[2]), vec![3.0, 4.0, 5.0]);
        assert_eq!((jobs[2].first_sequence, jobs[2].last_sequence), (3, 5));
        assert_eq!(assembler.len(), 3);
    }

    fn jobs_for(confidences: &[f32]) -> usize {
        let mut assembler = SequenceAssembler::new(StreamId::new("s"), "hall", 3, 0.7);
        confidences
            .iter()
            .enumerate()
            .filter_map(|(i, c)| assembler.push(i as u64, feature(0.0, *c)))
            .count()
    }

    #[test]
    fn test_gate_uses_latest_confidence() {
        assert_eq!(jobs_for(&[0.9, 0.9, 0.5]), 0);
        assert_eq!(jobs_for(&[0.9, 0.9, 0.8]), 1);
        // Once full, every further push is evaluated on its own confidence
        assert_eq!(jobs_for(&[0.9, 0.9, 0.8, 0.2, 0.95]), 2);
    }

    #[test]
    fn test_gate_fires_once_for_fresh_window() {
        let mut assembler = SequenceAssembler::new(StreamId::new("s"), "hall", 3, 0.7);

        assert!(assembler.push(0, feature(0.0, 0.9)).is_none());
        assert!(assembler.push(1, feature(0.0, 0.9)).is_none());
        assert_eq!(assembler.state(), AssemblerState::Filling);
        let job = assembler.push(2, feature(0.0, 0.8)).unwrap();

        assert_eq!(job.len(), 3);
        assert_eq!(assembler.emitted(), 1);
        assert_eq!(assembler.state(), AssemblerState::Filling);
        // The window keeps its contents after emitting
        assert_eq!(assembler.window_sequences(), vec![0, 1, 2]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut assembler = SequenceAssembler::new(StreamId::new("s"), "hall", 1, 0.7);
        assert!(assembler.push(0, feature(0.0, 0.7)).is_none());
        assert!(assembler.push(1, feature(0.0, 0.71)).is_some());
    }

    #[test]
    fn test_job_is_a_copy_of_the_window() {
        let mut assembler = SequenceAssembler::new(StreamId::new("cam"), "dock", 2, 0.1);
        assembler.push(0, feature(1.0, 0.9));
        let job = assembler.push(1, feature(2.0, 0.9)).unwrap();
        assembler.push(2, feature(3.0, 0.9));

        assert_eq!(tags(&job), vec![1.0, 2.0]);
        assert_eq!(job.stream_id.as_str(), "cam");
        assert_eq!(job.location, "dock");
    }

    #[test]
    fn test_reset_empties_window() {
        let mut assembler = SequenceAssembler::new(StreamId::new("s"), "hall", 2, 0.5);
        assembler.push(0, feature(0.0, 0.1));
        assembler.reset();
        assert!(assembler.is_empty());
        assert!(assembler.push(1, feature(0.0, 0.9)).is_none());
    }
}

//! Pipeline orchestrator
//!
//! Wires the per-stream capture and analysis loops to a fixed pool of
//! recognition workers and a single result collector.
//!
//! ```text
//! source -> StreamCapture -> RingBuffer -> extractor -> SequenceAssembler
//!        -> Dispatcher -> worker queue -> Worker -> output queue -> ResultCollector
//! ```
//!
//! Per-item failures (read errors, dropped jobs, failed inferences, sink
//! errors) are logged and counted in [`PipelineStats`]; only startup
//! exhaustion surfaces as an error from [`Pipeline::start`].

pub mod analyzer;
pub mod assembler;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod monitor;
pub mod pipeline;
pub mod stats;
pub mod worker;

pub use analyzer::StreamAnalyzer;
pub use assembler::{AssemblerState, SequenceAssembler};
pub use collector::ResultCollector;
pub use config::{ConfigError, PipelineConfig};
pub use dispatcher::{assign_worker, stable_hash, Dispatcher};
pub use monitor::{QueueDepths, QueueMonitor};
pub use pipeline::{recognizer_factory, Pipeline, PipelineComponents, ShutdownSummary};
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker::{
    predict_in_chunks, PoolShutdownReport, RecognizerFactory, WorkerPool, WorkerQueue, WorkerSettings,
    WorkerState,
};

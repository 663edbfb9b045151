//! Stream ingestion: source handles, per-stream capture loops and the
//! bounded frame buffer they write into

pub mod capture;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source;
pub mod preprocess;
pub mod ring_buffer;
pub mod source;

pub use capture::{CaptureCounters, CaptureSettings, StreamCapture};
pub use preprocess::preprocess;
pub use ring_buffer::{NotEnoughData, RingBuffer};
pub use source::{DefaultSourceOpener, FrameSource, ImageSequenceSource, ReadOutcome, SourceOpener};

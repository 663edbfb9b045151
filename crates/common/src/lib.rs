/// Common types and errors shared by the lipwatch pipeline crates
use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Pipeline errors
///
/// Per-item failures (`SourceRead`, `QueueFull`, `WorkerUnavailable`,
/// `WorkerInference`) are absorbed where they happen and only counted and
/// logged. `Startup` and `InvalidConfig` surface to the caller of the
/// pipeline's start operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to open source {locator}: {reason}")]
    SourceOpen { locator: String, reason: String },

    #[error("Read failed on stream {stream}: {reason}")]
    SourceRead { stream: StreamId, reason: String },

    #[error("Input queue of {worker} is full")]
    QueueFull { worker: WorkerId },

    #[error("{worker} is not accepting jobs")]
    WorkerUnavailable { worker: WorkerId },

    #[error("Recognition failed after {attempts} attempt(s): {reason}")]
    WorkerInference { attempts: u32, reason: String },

    #[error("{worker} terminated unexpectedly")]
    WorkerCrash { worker: WorkerId },

    #[error("{component} did not stop within {timeout:?}")]
    ShutdownTimeout { component: String, timeout: Duration },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline failed to start: {0}")]
    Startup(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(StreamId),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        PipelineError::ImageError(err.to_string())
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// Streams
// ============================================================================

/// Stable identifier of a configured stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of video source behind a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Local capture device (webcam)
    #[serde(alias = "webcam")]
    Device,
    /// Network stream (RTSP, HTTP)
    #[serde(alias = "rtsp")]
    Network,
    /// Video file or image-sequence directory
    File,
}

impl StreamKind {
    /// Live sources never end; a file source ends at end-of-stream
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(self, Self::File)
    }
}

/// Cheap per-frame preprocessing applied by the capture loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessOptions {
    /// Target size as `[width, height]` (None = keep source size)
    #[serde(default = "default_resize")]
    pub resize: Option<[u32; 2]>,

    /// Convert to a single luminance channel instead of RGB
    #[serde(default)]
    pub grayscale: bool,

    /// Scale pixel values to `[0, 1]` floats
    #[serde(default = "default_true")]
    pub normalize: bool,
}

fn default_resize() -> Option<[u32; 2]> {
    Some([640, 480])
}

fn default_true() -> bool {
    true
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            resize: default_resize(),
            grayscale: false,
            normalize: true,
        }
    }
}

/// One configured video source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: StreamId,

    /// Device index/path, stream URL or file path
    #[serde(rename = "source")]
    pub locator: String,

    #[serde(rename = "type")]
    pub kind: StreamKind,

    /// Location tag carried on every job from this stream
    #[serde(default = "default_location")]
    pub location: String,

    /// Target frame rate (None = use the source's rate)
    #[serde(default)]
    pub target_fps: Option<f64>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub preprocess: PreprocessOptions,
}

fn default_location() -> String {
    "unknown".to_string()
}

impl StreamDescriptor {
    pub fn new(id: impl Into<StreamId>, locator: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            kind,
            location: default_location(),
            target_fps: None,
            enabled: true,
            preprocess: PreprocessOptions::default(),
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    #[must_use]
    pub fn with_target_fps(mut self, fps: f64) -> Self {
        self.target_fps = Some(fps);
        self
    }
}

// ============================================================================
// Frames and features
// ============================================================================

/// Pixel buffer of a captured frame after preprocessing
#[derive(Debug, Clone)]
pub enum FramePixels {
    Rgb(RgbImage),
    Luma(GrayImage),
    /// Values in `[0, 1]`, shape `(height, width, channels)`
    Normalized(Array3<f32>),
}

impl FramePixels {
    /// (width, height)
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Rgb(img) => img.dimensions(),
            Self::Luma(img) => img.dimensions(),
            Self::Normalized(arr) => {
                let (h, w, _) = arr.dim();
                (w as u32, h as u32)
            }
        }
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        match self {
            Self::Rgb(_) => 3,
            Self::Luma(_) => 1,
            Self::Normalized(arr) => arr.dim().2,
        }
    }

    /// Luminance plane in `[0, 1]`, row-major
    #[must_use]
    pub fn luma_f32(&self) -> Vec<f32> {
        match self {
            Self::Rgb(img) => img
                .pixels()
                .map(|p| luminance(p.0[0] as f32, p.0[1] as f32, p.0[2] as f32) / 255.0)
                .collect(),
            Self::Luma(img) => img.pixels().map(|p| p.0[0] as f32 / 255.0).collect(),
            Self::Normalized(arr) => {
                let (h, w, c) = arr.dim();
                let mut out = Vec::with_capacity(h * w);
                for y in 0..h {
                    for x in 0..w {
                        let v = if c >= 3 {
                            luminance(arr[[y, x, 0]], arr[[y, x, 1]], arr[[y, x, 2]])
                        } else {
                            arr[[y, x, 0]]
                        };
                        out.push(v);
                    }
                }
                out
            }
        }
    }
}

fn luminance(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub stream_id: StreamId,
    /// Monotonically increasing per stream, starting at 0
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub pixels: FramePixels,
}

/// Fixed-shape numeric summary of a frame's region of interest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
    /// Quality score reported by the extractor, not the recognition confidence
    pub confidence: f32,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>, confidence: f32) -> Self {
        Self { values, confidence }
    }
}

/// Outcome of running the feature extractor on one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Feature(FeatureVector),
    /// Nothing usable in the frame; the window does not move
    NoDetection,
}

// ============================================================================
// Jobs and results
// ============================================================================

/// Identifier of a worker pool member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// One unit of recognition work
///
/// The batch is shared immutably; cloning a job never copies features.
#[derive(Debug, Clone)]
pub struct DetectionJob {
    pub correlation_id: Uuid,
    pub stream_id: StreamId,
    pub location: String,
    pub batch: Arc<[FeatureVector]>,
    /// Sequence numbers of the first and last frame in the batch
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub submitted_at: DateTime<Utc>,
}

impl DetectionJob {
    pub fn new(
        stream_id: StreamId,
        location: impl Into<String>,
        batch: Vec<FeatureVector>,
        first_sequence: u64,
        last_sequence: u64,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            stream_id,
            location: location.into(),
            batch: batch.into(),
            first_sequence,
            last_sequence,
            submitted_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Error code carried by a failed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCode {
    /// The recognition capability failed after its own retries
    Inference,
    /// The job was still queued when its worker was stopped or died
    Abandoned,
    /// The worker panicked while running the job
    Crashed,
}

impl JobErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inference => "inference",
            Self::Abandoned => "abandoned",
            Self::Crashed => "crashed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// Outcome of a job
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub correlation_id: Uuid,
    pub stream_id: StreamId,
    pub location: String,
    pub worker: WorkerId,
    /// Predicted text, possibly empty
    pub text: String,
    pub confidence: f32,
    pub latency: Duration,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<JobError>,
}

impl DetectionResult {
    pub fn success(
        job: &DetectionJob,
        worker: WorkerId,
        text: String,
        confidence: f32,
        latency: Duration,
    ) -> Self {
        Self {
            correlation_id: job.correlation_id,
            stream_id: job.stream_id.clone(),
            location: job.location.clone(),
            worker,
            text,
            confidence,
            latency,
            submitted_at: job.submitted_at,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn failure(job: &DetectionJob, worker: WorkerId, error: JobError, latency: Duration) -> Self {
        Self {
            correlation_id: job.correlation_id,
            stream_id: job.stream_id.clone(),
            location: job.location.clone(),
            worker,
            text: String::new(),
            confidence: 0.0,
            latency,
            submitted_at: job.submitted_at,
            completed_at: Utc::now(),
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

//! Source handles: open a stream's locator and pull raw frames from it
//!
//! The capture loop only talks to [`FrameSource`]. Built-in sources:
//! - [`ImageSequenceSource`]: a directory of still images (file streams)
//! - `FfmpegSource`: devices, network streams and video files
//!   (requires the `ffmpeg` feature)

use image::DynamicImage;
use lipwatch_common::{PipelineError, Result, StreamDescriptor, StreamKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Result of one blocking read
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(DynamicImage),
    EndOfStream,
}

/// An open source handle
pub trait FrameSource: Send {
    /// Block until the next frame is available
    ///
    /// # Errors
    ///
    /// Any error is treated by the capture loop as a transient read failure.
    fn read_frame(&mut self) -> Result<ReadOutcome>;

    /// Frame rate reported by the source, if known
    fn frame_rate(&self) -> Option<f64> {
        None
    }

    /// Release the underlying handle; further reads return end-of-stream
    fn close(&mut self);
}

/// Opens source handles from stream descriptors
pub trait SourceOpener: Send + Sync {
    /// # Errors
    ///
    /// Returns `PipelineError::SourceOpen` if the locator cannot be opened.
    fn open(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSource>>;
}

/// Opener for the built-in sources
///
/// A file stream whose locator is a directory is read as an image sequence.
/// Everything else goes through FFmpeg when the `ffmpeg` feature is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSourceOpener;

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSource>> {
        let path = Path::new(&descriptor.locator);
        if descriptor.kind == StreamKind::File && path.is_dir() {
            return Ok(Box::new(ImageSequenceSource::open(path)?));
        }
        open_with_ffmpeg(descriptor)
    }
}

#[cfg(feature = "ffmpeg")]
fn open_with_ffmpeg(descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(crate::ffmpeg_source::FfmpegSource::open(
        &descriptor.locator,
        descriptor.kind,
    )?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_with_ffmpeg(descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSource>> {
    Err(PipelineError::SourceOpen {
        locator: descriptor.locator.clone(),
        reason: format!(
            "{:?} sources need the `ffmpeg` feature (only image-sequence directories are built in)",
            descriptor.kind
        ),
    })
}

// ============================================================================
// Image sequence source
// ============================================================================

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Reads the images of a directory in file-name order
#[derive(Debug)]
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next: usize,
    closed: bool,
}

impl ImageSequenceSource {
    /// List the images of `dir`
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::SourceOpen` if the directory cannot be read or
    /// holds no images.
    pub fn open(dir: &Path) -> Result<Self> {
        let open_err = |reason: String| PipelineError::SourceOpen {
            locator: dir.display().to_string(),
            reason,
        };

        let entries = std::fs::read_dir(dir).map_err(|e| open_err(e.to_string()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(open_err("directory contains no images".to_string()));
        }

        info!("Opened image sequence {:?} ({} frames)", dir, files.len());
        Ok(Self {
            files,
            next: 0,
            closed: false,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn read_frame(&mut self) -> Result<ReadOutcome> {
        if self.closed || self.next >= self.files.len() {
            return Ok(ReadOutcome::EndOfStream);
        }
        let path = &self.files[self.next];
        // Advance even on failure so one unreadable file cannot wedge the stream
        self.next += 1;
        debug!("Reading frame {:?}", path);
        image::open(path)
            .map(ReadOutcome::Frame)
            .map_err(|e| PipelineError::ImageError(format!("{}: {e}", path.display())))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

//! FFmpeg-backed source for devices, network streams and video files

use crate::source::{FrameSource, ReadOutcome};
use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};
use lipwatch_common::{PipelineError, Result, StreamKind};
use tracing::{debug, info};

/// Initialize `FFmpeg` library
fn init_ffmpeg() -> Result<()> {
    static INIT: std::sync::OnceLock<std::result::Result<(), String>> = std::sync::OnceLock::new();
    INIT.get_or_init(|| {
        ffmpeg::init().map_err(|e| format!("Failed to initialize FFmpeg: {e}"))
    })
    .clone()
    .map_err(PipelineError::Other)
}

/// Map a device locator to something libavformat can open
///
/// A bare index such as `"0"` becomes `/dev/video0`.
fn device_path(locator: &str) -> String {
    if locator.chars().all(|c| c.is_ascii_digit()) && !locator.is_empty() {
        format!("/dev/video{locator}")
    } else {
        locator.to_string()
    }
}

/// Decodes the best video stream of an input to RGB frames
pub struct FfmpegSource {
    input: Option<ffmpeg::format::context::Input>,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    frame_rate: Option<f64>,
    eof_sent: bool,
    decoded: ffmpeg::util::frame::video::Video,
    converted: ffmpeg::util::frame::video::Video,
}

// Safety: the FFmpeg contexts are owned exclusively by this source and only
// touched from the capture thread that owns it.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    /// Open `locator` and prepare a decoder for its best video stream
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::SourceOpen` if the input cannot be opened, has
    /// no video stream, or the decoder/scaler cannot be created.
    pub fn open(locator: &str, kind: StreamKind) -> Result<Self> {
        init_ffmpeg()?;
        let open_err = |reason: String| PipelineError::SourceOpen {
            locator: locator.to_string(),
            reason,
        };

        let target = match kind {
            StreamKind::Device => device_path(locator),
            StreamKind::Network | StreamKind::File => locator.to_string(),
        };

        let input = ffmpeg::format::input(target.as_str())
            .map_err(|e| open_err(format!("Failed to open input: {e}")))?;

        let (stream_index, frame_rate, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| open_err("No video stream found".to_string()))?;
            let rate = stream.avg_frame_rate();
            let fps = if rate.1 > 0 && rate.0 > 0 {
                Some(f64::from(rate.0) / f64::from(rate.1))
            } else {
                None
            };
            (stream.index(), fps, stream.parameters())
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| open_err(format!("Failed to create context: {e}")))?
            .decoder()
            .video()
            .map_err(|e| open_err(format!("Failed to create decoder: {e}")))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| open_err(format!("Failed to create scaler: {e}")))?;

        info!(
            "Opened {:?} source {} ({}x{}, fps={:?})",
            kind,
            locator,
            decoder.width(),
            decoder.height(),
            frame_rate
        );

        Ok(Self {
            input: Some(input),
            decoder,
            scaler,
            stream_index,
            frame_rate,
            eof_sent: false,
            decoded: ffmpeg::util::frame::video::Video::empty(),
            converted: ffmpeg::util::frame::video::Video::empty(),
        })
    }

    fn convert_current(&mut self) -> Result<DynamicImage> {
        self.scaler
            .run(&self.decoded, &mut self.converted)
            .map_err(|e| PipelineError::Other(format!("Failed to convert frame: {e}")))?;

        let width = self.converted.width() as usize;
        let height = self.converted.height() as usize;
        let stride = self.converted.stride(0);
        let plane = self.converted.data(0);

        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            let row_start = y * stride;
            data.extend_from_slice(&plane[row_start..row_start + width * 3]);
        }

        RgbImage::from_raw(width as u32, height as u32, data)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| PipelineError::Other("Decoded frame has an unexpected size".to_string()))
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<ReadOutcome> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_current().map(ReadOutcome::Frame);
            }
            if self.eof_sent {
                return Ok(ReadOutcome::EndOfStream);
            }
            let Some(input) = self.input.as_mut() else {
                return Ok(ReadOutcome::EndOfStream);
            };

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|e| PipelineError::Other(format!("Failed to decode packet: {e}")))?;
                }
                Err(ffmpeg::Error::Eof) => {
                    debug!("Input reached end of stream, flushing decoder");
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
                Err(e) => {
                    return Err(PipelineError::Other(format!("Failed to read packet: {e}")));
                }
            }
        }
    }

    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn close(&mut self) {
        self.input = None;
        self.eof_sent = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_mapping() {
        assert_eq!(device_path("0"), "/dev/video0");
        assert_eq!(device_path("12"), "/dev/video12");
        assert_eq!(device_path("/dev/video2"), "/dev/video2");
        assert_eq!(device_path(""), "");
    }

    #[test]
    fn test_open_missing_file_fails() {
        let result = FfmpegSource::open("/nonexistent/clip.mp4", StreamKind::File);
        assert!(matches!(result, Err(PipelineError::SourceOpen { .. })));
    }
}

//! Per-frame feature extraction
//!
//! The pipeline calls a [`FeatureExtractor`] once per captured frame. The
//! extractor returns a fixed-shape [`FeatureVector`] together with a quality
//! score, or [`Extraction::NoDetection`] when the frame holds nothing usable.
//!
//! # Example
//! ```no_run
//! use lipwatch_features::{ExtractorConfig, FeatureExtractor, RoiPatchExtractor};
//! # fn run(frame: &lipwatch_common::FrameSample) {
//! let mut extractor = RoiPatchExtractor::new(ExtractorConfig::default());
//! match extractor.extract(frame) {
//!     lipwatch_common::Extraction::Feature(f) => println!("quality {:.2}", f.confidence),
//!     lipwatch_common::Extraction::NoDetection => println!("nothing in frame"),
//! }
//! # }
//! ```

use lipwatch_common::{Extraction, FeatureVector, FrameSample, StreamDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Turns a frame into a feature vector
///
/// Each stream owns its own extractor instance, so implementations may keep
/// per-stream state (smoothing, tracking) without locking.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, frame: &FrameSample) -> Extraction;
}

impl<F> FeatureExtractor for F
where
    F: FnMut(&FrameSample) -> Extraction + Send,
{
    fn extract(&mut self, frame: &FrameSample) -> Extraction {
        self(frame)
    }
}

/// Builds one extractor per stream
pub type ExtractorFactory = Arc<dyn Fn(&StreamDescriptor) -> Box<dyn FeatureExtractor> + Send + Sync>;

/// Factory producing [`RoiPatchExtractor`]s that share one configuration
#[must_use]
pub fn roi_factory(config: ExtractorConfig) -> ExtractorFactory {
    Arc::new(move |_descriptor: &StreamDescriptor| -> Box<dyn FeatureExtractor> {
        Box::new(RoiPatchExtractor::new(config.clone()))
    })
}

// ============================================================================
// Region-of-interest patch extractor
// ============================================================================

/// Region of a frame, in fractions of its width and height
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativeRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for RelativeRegion {
    /// Lower-middle of the frame, where the mouth sits in a centred face shot
    fn default() -> Self {
        Self {
            x: 0.25,
            y: 0.55,
            width: 0.5,
            height: 0.35,
        }
    }
}

/// Configuration for [`RoiPatchExtractor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub region: RelativeRegion,
    /// Patch size as `[width, height]`
    pub target_size: [u32; 2],
    /// Patches whose standard deviation is below this are reported as no detection
    pub min_contrast: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            region: RelativeRegion::default(),
            target_size: [100, 50],
            min_contrast: 0.02,
        }
    }
}

/// Standard deviation at which the quality score saturates at 1.0
const FULL_CONTRAST: f32 = 0.25;

/// Crops a fixed region, converts it to luminance, resamples it to the
/// target size and emits the normalized patch as the feature vector
///
/// The quality score grows with the patch's contrast. A flat patch (lens
/// cap, blank wall, dropped signal) is reported as no detection.
#[derive(Debug, Clone)]
pub struct RoiPatchExtractor {
    config: ExtractorConfig,
}

impl RoiPatchExtractor {
    #[must_use]
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Pixel bounds `(x0, y0, x1, y1)` of the region inside a `width`x`height` frame
    fn region_bounds(&self, width: u32, height: u32) -> Option<(usize, usize, usize, usize)> {
        let r = &self.config.region;
        if r.width <= 0.0 || r.height <= 0.0 {
            return None;
        }
        let clamp = |v: f32| v.clamp(0.0, 1.0);
        let x0 = (clamp(r.x) * width as f32) as usize;
        let y0 = (clamp(r.y) * height as f32) as usize;
        let x1 = (clamp(r.x + r.width) * width as f32).ceil() as usize;
        let y1 = (clamp(r.y + r.height) * height as f32).ceil() as usize;
        let x1 = x1.min(width as usize);
        let y1 = y1.min(height as usize);
        (x1 > x0 && y1 > y0).then_some((x0, y0, x1, y1))
    }
}

impl FeatureExtractor for RoiPatchExtractor {
    fn extract(&mut self, frame: &FrameSample) -> Extraction {
        let (width, height) = frame.pixels.dimensions();
        let Some((x0, y0, x1, y1)) = self.region_bounds(width, height) else {
            debug!(stream = %frame.stream_id, "Region of interest is empty in {}x{} frame", width, height);
            return Extraction::NoDetection;
        };

        let luma = frame.pixels.luma_f32();
        let [target_w, target_h] = self.config.target_size;
        let patch = resample(
            &luma,
            width as usize,
            (x0, y0, x1 - x0, y1 - y0),
            target_w.max(1) as usize,
            target_h.max(1) as usize,
        );

        let contrast = std_dev(&patch);
        if contrast < self.config.min_contrast {
            debug!(stream = %frame.stream_id, "Frame {} below contrast floor ({:.3})", frame.sequence, contrast);
            return Extraction::NoDetection;
        }

        let confidence = (contrast / FULL_CONTRAST).min(1.0);
        Extraction::Feature(FeatureVector::new(patch, confidence))
    }
}

/// Bilinear resample of a crop `(x, y, w, h)` of a row-major plane
fn resample(
    plane: &[f32],
    stride: usize,
    (cx, cy, cw, ch): (usize, usize, usize, usize),
    out_w: usize,
    out_h: usize,
) -> Vec<f32> {
    let sample = |x: usize, y: usize| plane.get((cy + y) * stride + cx + x).copied().unwrap_or(0.0);
    let scale_x = cw as f32 / out_w as f32;
    let scale_y = ch as f32 / out_h as f32;

    let mut out = Vec::with_capacity(out_w * out_h);
    for oy in 0..out_h {
        let fy = ((oy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (ch - 1) as f32);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(ch - 1);
        let ty = fy - y0 as f32;
        for ox in 0..out_w {
            let fx = ((ox as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (cw - 1) as f32);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(cw - 1);
            let tx = fx - x0 as f32;

            let top = sample(x0, y0) * (1.0 - tx) + sample(x1, y0) * tx;
            let bottom = sample(x0, y1) * (1.0 - tx) + sample(x1, y1) * tx;
            out.push(top * (1.0 - ty) + bottom * ty);
        }
    }
    out
}

fn std_dev(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::{GrayImage, Luma};
    use lipwatch_common::{FramePixels, StreamId};

    fn frame(pixels: FramePixels) -> FrameSample {
        FrameSample {
            stream_id: StreamId::new("cam"),
            sequence: 7,
            captured_at: Utc::now(),
            pixels,
        }
    }

    fn striped(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| if x % 2 == 0 { Luma([0]) } else { Luma([255]) })
    }

    #[test]
    fn test_textured_patch_has_target_shape() {
        let mut extractor = RoiPatchExtractor::new(ExtractorConfig::default());
        let sample = frame(FramePixels::Luma(striped(640, 480)));

        match extractor.extract(&sample) {
            Extraction::Feature(feature) => {
                assert_eq!(feature.values.len(), 100 * 50);
                assert!(feature.values.iter().all(|v| (0.0..=1.0).contains(v)));
                assert!(feature.confidence > 0.0 && feature.confidence <= 1.0);
            }
            Extraction::NoDetection => panic!("textured frame should produce a feature"),
        }
    }

    #[test]
    fn test_flat_frame_is_no_detection() {
        let mut extractor = RoiPatchExtractor::new(ExtractorConfig::default());
        let sample = frame(FramePixels::Luma(GrayImage::from_pixel(64, 48, Luma([90]))));
        assert_eq!(extractor.extract(&sample), Extraction::NoDetection);
    }

    #[test]
    fn test_empty_region_is_no_detection() {
        let config = ExtractorConfig {
            region: RelativeRegion {
                x: 0.9,
                y: 0.9,
                width: 0.0,
                height: 0.0,
            },
            ..ExtractorConfig::default()
        };
        let mut extractor = RoiPatchExtractor::new(config);
        let sample = frame(FramePixels::Luma(striped(64, 48)));
        assert_eq!(extractor.extract(&sample), Extraction::NoDetection);
    }

    #[test]
    fn test_high_contrast_saturates_confidence() {
        let config = ExtractorConfig {
            region: RelativeRegion {
                x: 0.0,
                y: 0.0,
                width: 1.0,
                height: 1.0,
            },
            target_size: [8, 4],
            min_contrast: 0.02,
        };
        let mut extractor = RoiPatchExtractor::new(config);
        // Left half black, right half white
        let img = GrayImage::from_fn(8, 4, |x, _| if x < 4 { Luma([0]) } else { Luma([255]) });

        match extractor.extract(&frame(FramePixels::Luma(img))) {
            Extraction::Feature(feature) => {
                assert_eq!(feature.values.len(), 32);
                assert!((feature.confidence - 1.0).abs() < 1e-6);
                assert!(feature.values[0] < 0.01);
                assert!(feature.values[7] > 0.99);
            }
            Extraction::NoDetection => panic!("expected a feature"),
        }
    }

    #[test]
    fn test_normalized_input_is_supported() {
        let mut arr = ndarray::Array3::<f32>::zeros((20, 20, 1));
        for y in 0..20 {
            for x in (0..20).step_by(2) {
                arr[[y, x, 0]] = 1.0;
            }
        }
        let mut extractor = RoiPatchExtractor::new(ExtractorConfig::default());
        assert!(matches!(
            extractor.extract(&frame(FramePixels::Normalized(arr))),
            Extraction::Feature(_)
        ));
    }

    #[test]
    fn test_closure_extractor_and_factory() {
        let mut calls = 0;
        let mut counting = |_: &FrameSample| {
            calls += 1;
            Extraction::NoDetection
        };
        let sample = frame(FramePixels::Luma(striped(4, 4)));
        assert_eq!(FeatureExtractor::extract(&mut counting, &sample), Extraction::NoDetection);
        assert_eq!(calls, 1);

        let factory = roi_factory(ExtractorConfig::default());
        let descriptor = StreamDescriptor::new("cam", "0", lipwatch_common::StreamKind::Device);
        let mut extractor = factory(&descriptor);
        assert!(matches!(extractor.extract(&frame(FramePixels::Luma(striped(64, 48)))), Extraction::Feature(_)));
    }

    #[test]
    fn test_config_partial_yaml_uses_defaults() {
        let config: ExtractorConfig = serde_yaml::from_str("min_contrast: 0.1\n").unwrap();
        assert_eq!(config.target_size, [100, 50]);
        assert!((config.min_contrast - 0.1).abs() < 1e-6);
    }
}

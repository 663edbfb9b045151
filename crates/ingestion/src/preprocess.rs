/// Per-frame preprocessing applied before a frame enters the ring buffer
use image::imageops::FilterType;
use image::DynamicImage;
use lipwatch_common::{FramePixels, PreprocessOptions};
use ndarray::Array3;

/// Resize, convert and optionally normalize a decoded frame
///
/// Normalized output has shape `(height, width, channels)` with values in
/// `[0, 1]`.
#[must_use]
pub fn preprocess(image: DynamicImage, options: &PreprocessOptions) -> FramePixels {
    let image = match options.resize {
        Some([width, height]) if image.width() != width || image.height() != height => {
            image.resize_exact(width, height, FilterType::Triangle)
        }
        _ => image,
    };

    if options.grayscale {
        let gray = image.to_luma8();
        if !options.normalize {
            return FramePixels::Luma(gray);
        }
        let (w, h) = gray.dimensions();
        let data: Vec<f32> = gray.into_raw().into_iter().map(|v| f32::from(v) / 255.0).collect();
        return to_array(data, h, w, 1);
    }

    let rgb = image.to_rgb8();
    if !options.normalize {
        return FramePixels::Rgb(rgb);
    }
    let (w, h) = rgb.dimensions();
    let data: Vec<f32> = rgb.into_raw().into_iter().map(|v| f32::from(v) / 255.0).collect();
    to_array(data, h, w, 3)
}

fn to_array(data: Vec<f32>, height: u32, width: u32, channels: usize) -> FramePixels {
    let shape = (height as usize, width as usize, channels);
    match Array3::from_shape_vec(shape, data) {
        Ok(arr) => FramePixels::Normalized(arr),
        // The buffer always matches the image dimensions
        Err(_) => FramePixels::Normalized(Array3::zeros(shape)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn test_default_options_resize_and_normalize() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 24, Rgb([255, 0, 0])));
        let pixels = preprocess(img, &PreprocessOptions::default());

        assert_eq!(pixels.dimensions(), (640, 480));
        assert_eq!(pixels.channels(), 3);
        match pixels {
            FramePixels::Normalized(arr) => {
                assert!((arr[[0, 0, 0]] - 1.0).abs() < 1e-6);
                assert!(arr[[0, 0, 1]].abs() < 1e-6);
            }
            other => panic!("expected normalized pixels, got {other:?}"),
        }
    }

    #[test]
    fn test_grayscale_without_normalize_keeps_bytes() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([128])));
        let options = PreprocessOptions {
            resize: None,
            grayscale: true,
            normalize: false,
        };

        match preprocess(img, &options) {
            FramePixels::Luma(gray) => {
                assert_eq!(gray.dimensions(), (8, 8));
                assert_eq!(gray.get_pixel(3, 3).0[0], 128);
            }
            other => panic!("expected luma pixels, got {other:?}"),
        }
    }

    #[test]
    fn test_grayscale_normalized_has_one_channel() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 6, Rgb([255, 255, 255])));
        let options = PreprocessOptions {
            resize: Some([5, 3]),
            grayscale: true,
            normalize: true,
        };

        let pixels = preprocess(img, &options);
        assert_eq!(pixels.dimensions(), (5, 3));
        assert_eq!(pixels.channels(), 1);
        assert!(pixels.luma_f32().iter().all(|v| (v - 1.0).abs() < 1e-3));
    }
}

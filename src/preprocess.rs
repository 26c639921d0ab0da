//! Turns a decoded image into the normalized tensor the classifier was
//! trained on.
//!
//! The transform has to match training exactly. A mismatch in resize size,
//! crop offsets, rescale divisor or channel statistics does not raise any
//! error, it just makes every prediction worse.

use crate::leaf_model::ModelError;
use crate::model_config::{ImageSize, PreprocessorConfig};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::{Array3, Array4, Axis};

/// Crop rectangle as (left, top, right, bottom), right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropBox {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// Box that removes equal margins from every edge of `source` to reach
/// `target`. `target` must fit inside `source`.
pub fn center_crop_box(source: ImageSize, target: ImageSize) -> CropBox {
    let left = (source.width - target.width) / 2;
    let top = (source.height - target.height) / 2;
    CropBox {
        left,
        top,
        right: left + target.width,
        bottom: top + target.height,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    mean: [f32; 3],
    std: [f32; 3],
    divisor: f64,
}

impl Normalization {
    pub fn new(mean: [f32; 3], std: [f32; 3], divisor: f64) -> Self {
        Self { mean, std, divisor }
    }

    /// `(value / divisor - mean[c]) / std[c]`, evaluated in f64 and narrowed.
    pub fn normalize(&self, value: u8, channel: usize) -> f32 {
        let scaled = f64::from(value) / self.divisor;
        ((scaled - f64::from(self.mean[channel])) / f64::from(self.std[channel])) as f32
    }

    /// Inverse of [`normalize`](Self::normalize) up to the rescale step:
    /// returns `value * std[c] + mean[c]`.
    #[cfg(test)]
    pub fn denormalize(&self, value: f64, channel: usize) -> f64 {
        value * f64::from(self.std[channel]) + f64::from(self.mean[channel])
    }

    #[cfg(test)]
    pub fn divisor(&self) -> f64 {
        self.divisor
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    resize: ImageSize,
    crop: CropBox,
    filter: FilterType,
    normalization: Normalization,
}

impl Preprocessor {
    pub fn new(config: &PreprocessorConfig) -> Result<Self, ModelError> {
        config.validate()?;
        Ok(Self {
            resize: config.resize,
            crop: center_crop_box(config.resize, config.crop),
            filter: config.resample.filter_type(),
            normalization: Normalization::new(
                config.image_mean,
                config.image_std,
                config.rescale_divisor,
            ),
        })
    }

    pub fn crop_box(&self) -> CropBox {
        self.crop
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    /// Shape of a single preprocessed image: (channels, height, width).
    pub fn output_shape(&self) -> (usize, usize, usize) {
        (3, self.crop.height() as usize, self.crop.width() as usize)
    }

    /// Resize, center-crop, then normalize into channel-first layout.
    pub fn preprocess(&self, image: &DynamicImage) -> Array3<f32> {
        let rgb_image: RgbImage = image.to_rgb8();
        let resized = imageops::resize(
            &rgb_image,
            self.resize.width,
            self.resize.height,
            self.filter,
        );
        let cropped = imageops::crop_imm(
            &resized,
            self.crop.left,
            self.crop.top,
            self.crop.width(),
            self.crop.height(),
        )
        .to_image();

        let mut array = Array3::zeros(self.output_shape());
        for (x, y, pixel) in cropped.enumerate_pixels() {
            for c in 0..3 {
                array[[c, y as usize, x as usize]] = self.normalization.normalize(pixel[c], c);
            }
        }
        array
    }

    /// Same as [`preprocess`](Self::preprocess) with a leading batch axis of 1.
    pub fn preprocess_batch(&self, image: &DynamicImage) -> Array4<f32> {
        self.preprocess(image).insert_axis(Axis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_config::{DEFAULT_IMAGE_MEAN, DEFAULT_IMAGE_STD, Resample};
    use image::{Rgb, RgbImage};

    fn default_preprocessor() -> Preprocessor {
        Preprocessor::new(&PreprocessorConfig::default()).unwrap()
    }

    fn gradient_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x * 7 + y * 3) % 256) as u8])
        }))
    }

    #[test]
    fn test_center_crop_box_for_training_geometry() {
        let crop = center_crop_box(ImageSize::square(256), ImageSize::square(224));
        assert_eq!(
            (crop.left, crop.top, crop.right, crop.bottom),
            (16, 16, 240, 240)
        );
        assert_eq!(crop.width(), 224);
        assert_eq!(crop.height(), 224);
        assert_eq!(default_preprocessor().crop_box(), crop);
    }

    #[test]
    fn test_output_shape_for_any_resolution() {
        let preprocessor = default_preprocessor();
        for (width, height) in [(1, 1), (17, 300), (640, 480), (224, 224), (256, 256), (1024, 33)] {
            let tensor = preprocessor.preprocess(&gradient_image(width, height));
            assert_eq!(tensor.shape(), &[3, 224, 224], "input {width}x{height}");
        }
        let batch = preprocessor.preprocess_batch(&gradient_image(300, 200));
        assert_eq!(batch.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let preprocessor = default_preprocessor();
        let image = gradient_image(500, 375);
        let first = preprocessor.preprocess(&image);
        let second = preprocessor.preprocess(&image);
        assert_eq!(first, second);
    }

    #[test]
    fn test_mid_gray_normalization_arithmetic() {
        let preprocessor = default_preprocessor();
        let gray = DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, Rgb([128, 128, 128])));
        let tensor = preprocessor.preprocess(&gray);

        for c in 0..3 {
            let expected = ((128.0 / 256.0 - f64::from(DEFAULT_IMAGE_MEAN[c]))
                / f64::from(DEFAULT_IMAGE_STD[c])) as f32;
            assert!(
                tensor.index_axis(Axis(0), c).iter().all(|&v| v == expected),
                "channel {c} should be {expected}"
            );
        }
    }

    #[test]
    fn test_normalization_round_trip() {
        let normalization = *default_preprocessor().normalization();
        for channel in 0..3 {
            for pixel in 0..=255u8 {
                let normalized = normalization.normalize(pixel, channel);
                let recovered = normalization.denormalize(f64::from(normalized), channel)
                    * normalization.divisor();
                assert!(
                    (recovered - f64::from(pixel)).abs() < 1e-3,
                    "pixel {pixel} channel {channel} recovered as {recovered}"
                );
            }
        }
    }

    #[test]
    fn test_rescale_divides_by_256() {
        let normalization = Normalization::new([0.0; 3], [1.0; 3], 256.0);
        assert_eq!(normalization.normalize(255, 0), 255.0 / 256.0);
        assert_eq!(normalization.normalize(0, 1), 0.0);
        assert_eq!(normalization.normalize(64, 2), 0.25);
    }

    #[test]
    fn test_crop_keeps_center_pixels() {
        let config = PreprocessorConfig {
            resample: Resample::Nearest,
            image_mean: [0.0; 3],
            image_std: [1.0; 3],
            ..PreprocessorConfig::default()
        };
        let preprocessor = Preprocessor::new(&config).unwrap();
        let tensor = preprocessor.preprocess(&gradient_image(256, 256));

        // Red carries x, green carries y; the crop starts 16 pixels in.
        assert_eq!(tensor[[0, 0, 0]], 16.0 / 256.0);
        assert_eq!(tensor[[0, 0, 223]], 239.0 / 256.0);
        assert_eq!(tensor[[1, 0, 0]], 16.0 / 256.0);
        assert_eq!(tensor[[1, 223, 0]], 239.0 / 256.0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PreprocessorConfig {
            crop: ImageSize::square(512),
            ..PreprocessorConfig::default()
        };
        assert!(matches!(
            Preprocessor::new(&config),
            Err(ModelError::InvalidPreprocessing(_))
        ));
    }
}

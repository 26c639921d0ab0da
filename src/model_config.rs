// src/model_config.rs
use crate::leaf_model::ModelError;
use image::imageops::FilterType;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Per-channel mean of the maize training set (RGB).
pub const DEFAULT_IMAGE_MEAN: [f32; 3] = [0.4375, 0.5055, 0.3819];
/// Per-channel standard deviation of the maize training set (RGB).
pub const DEFAULT_IMAGE_STD: [f32; 3] = [0.2156, 0.2261, 0.2154];

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resample {
    Nearest,
    Bilinear,
    #[default]
    Bicubic,
    Lanczos,
}

impl Resample {
    pub fn filter_type(self) -> FilterType {
        match self {
            Resample::Nearest => FilterType::Nearest,
            Resample::Bilinear => FilterType::Triangle,
            Resample::Bicubic => FilterType::CatmullRom,
            Resample::Lanczos => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl ImageSize {
    pub const fn square(side: u32) -> Self {
        Self {
            height: side,
            width: side,
        }
    }
}

/// Geometry and normalization the checkpoint was trained with.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub resize: ImageSize,
    pub crop: ImageSize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_divisor: f64,
    pub resample: Resample,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            resize: ImageSize::square(256),
            crop: ImageSize::square(224),
            image_mean: DEFAULT_IMAGE_MEAN,
            image_std: DEFAULT_IMAGE_STD,
            rescale_divisor: 256.0,
            resample: Resample::default(),
        }
    }
}

impl PreprocessorConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.resize.width == 0 || self.resize.height == 0 {
            return Err(ModelError::InvalidPreprocessing(
                "resize dimensions must be non-zero".to_string(),
            ));
        }
        if self.crop.width == 0 || self.crop.height == 0 {
            return Err(ModelError::InvalidPreprocessing(
                "crop dimensions must be non-zero".to_string(),
            ));
        }
        if self.crop.width > self.resize.width || self.crop.height > self.resize.height {
            return Err(ModelError::InvalidPreprocessing(format!(
                "crop {}x{} does not fit inside resize {}x{}",
                self.crop.width, self.crop.height, self.resize.width, self.resize.height
            )));
        }
        if let Some(c) = self
            .image_std
            .iter()
            .position(|std| !std.is_finite() || *std == 0.0)
        {
            return Err(ModelError::InvalidPreprocessing(format!(
                "image_std[{c}] must be finite and non-zero"
            )));
        }
        if self.image_mean.iter().any(|mean| !mean.is_finite()) {
            return Err(ModelError::InvalidPreprocessing(
                "image_mean must be finite".to_string(),
            ));
        }
        if !(self.rescale_divisor.is_finite() && self.rescale_divisor > 0.0) {
            return Err(ModelError::InvalidPreprocessing(format!(
                "rescale_divisor must be positive, got {}",
                self.rescale_divisor
            )));
        }
        Ok(())
    }
}

/// Contents of `checkpoint.json`, stored next to the exported network.
///
/// Optimizer state written by the training pipeline is ignored.
#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointMetadata {
    pub class_to_idx: BTreeMap<String, usize>,
    #[serde(default)]
    pub idx_to_class: Option<BTreeMap<usize, String>>,
    #[serde(default)]
    pub epochs: u32,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub preprocessing: PreprocessorConfig,
}

impl CheckpointMetadata {
    pub fn from_path(path: &Path) -> Result<Self, ModelError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Bidirectional class label lookup. Indices are always `0..len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    idx_to_class: Vec<String>,
}

impl LabelMap {
    /// Builds the lookup from `class_to_idx`, checking `idx_to_class` against
    /// it when the checkpoint carries both.
    pub fn new(
        class_to_idx: BTreeMap<String, usize>,
        idx_to_class: Option<BTreeMap<usize, String>>,
    ) -> Result<Self, ModelError> {
        if class_to_idx.is_empty() {
            return Err(ModelError::Checkpoint(
                "class_to_idx declares no classes".to_string(),
            ));
        }

        let num_classes = class_to_idx.len();
        let mut inverse: Vec<Option<String>> = vec![None; num_classes];
        for (label, &idx) in &class_to_idx {
            let slot = inverse.get_mut(idx).ok_or_else(|| {
                ModelError::Checkpoint(format!(
                    "class {label:?} has index {idx}, outside 0..{num_classes}"
                ))
            })?;
            if let Some(previous) = slot {
                return Err(ModelError::Checkpoint(format!(
                    "classes {previous:?} and {label:?} share index {idx}"
                )));
            }
            *slot = Some(label.clone());
        }
        // num_classes distinct indices below num_classes fill every slot.
        let inverse: Vec<String> = inverse.into_iter().flatten().collect();

        if let Some(given) = idx_to_class {
            if given.len() != num_classes {
                return Err(ModelError::Checkpoint(format!(
                    "idx_to_class has {} entries, class_to_idx has {num_classes}",
                    given.len()
                )));
            }
            for (idx, label) in &given {
                if inverse.get(*idx) != Some(label) {
                    return Err(ModelError::Checkpoint(format!(
                        "idx_to_class maps {idx} to {label:?}, which class_to_idx does not"
                    )));
                }
            }
        }

        Ok(Self {
            idx_to_class: inverse,
        })
    }

    pub fn len(&self) -> usize {
        self.idx_to_class.len()
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.idx_to_class.get(idx).map(String::as_str)
    }

    #[cfg(test)]
    pub fn index(&self, label: &str) -> Option<usize> {
        self.idx_to_class.iter().position(|known| known == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.idx_to_class
    }
}

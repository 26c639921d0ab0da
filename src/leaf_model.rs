use crate::model_config::{CheckpointMetadata, LabelMap};
use crate::preprocess::Preprocessor;
use image::DynamicImage;
use ndarray::{Array2, ArrayView4, Ix2};
use ort::error::Error as OrtError;
use ort::inputs;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionOutputs};
use std::path::Path;

pub const MODEL_FILE: &str = "model.onnx";
pub const METADATA_FILE: &str = "checkpoint.json";
pub const DEFAULT_TOP_K: usize = 3;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] OrtError),
    #[error("Image processing error: {0}")]
    ImageProcessing(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checkpoint metadata error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Image fetch error: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("Invalid path for model files: {0}")]
    InvalidPath(String),
    #[error("Inconsistent checkpoint: {0}")]
    Checkpoint(String),
    #[error("Invalid preprocessing configuration: {0}")]
    InvalidPreprocessing(String),
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Image is {size} bytes, limit is {limit} bytes")]
    ImageTooLarge { size: usize, limit: usize },
    #[error("Input tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    InputShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Model output format unexpected: {0}")]
    OutputFormatUnexpected(String),
    #[error("top_k must be between 1 and {num_classes}, got {k}")]
    InvalidTopK { k: usize, num_classes: usize },
}

/// A network that maps a `1×3×H×W` batch to a `1×N` row of log-probabilities.
pub trait Classifier: Send + Sync {
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, ModelError>;
}

/// The exported backbone and classification head, run through ONNX Runtime.
///
/// The session holds no training graph, so the weights cannot change after
/// loading.
pub struct OnnxClassifier {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    pub fn from_file(model_path: &Path, intra_threads: usize) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::InvalidPath(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        tracing::info!(path = ?model_path, intra_threads, "loading ONNX model");
        let session = SessionBuilder::new()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| ModelError::Checkpoint("model declares no inputs".to_string()))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| ModelError::Checkpoint("model declares no outputs".to_string()))?;
        tracing::debug!(%input_name, %output_name, "ONNX Runtime session created");

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, ModelError> {
        let inputs = inputs![self.input_name.as_str() => batch.into_dyn()]?;
        let outputs: SessionOutputs = self.session.run(inputs)?;

        let output_value = outputs.get(&self.output_name).ok_or_else(|| {
            ModelError::OutputFormatUnexpected(format!("missing output {:?}", self.output_name))
        })?;
        let output_view = output_value.try_extract_tensor::<f32>()?;
        let shape = output_view.shape().to_vec();
        output_view
            .to_owned()
            .into_dimensionality::<Ix2>()
            .map_err(|_| {
                ModelError::OutputFormatUnexpected(format!("expected a 2-D output, got {shape:?}"))
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub probability: f32,
}

/// A loaded checkpoint: the classifier, its labels and the preprocessing it
/// was trained with. Never mutated after construction.
pub struct LeafModel<C = OnnxClassifier> {
    classifier: C,
    labels: LabelMap,
    preprocessor: Preprocessor,
    epochs: u32,
    model_version: String,
}

impl LeafModel<OnnxClassifier> {
    /// Loads `model.onnx` and `checkpoint.json` from `model_dir`.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, ModelError> {
        let model_path = model_dir.join(MODEL_FILE);
        let metadata_path = model_dir.join(METADATA_FILE);

        if !metadata_path.exists() {
            return Err(ModelError::InvalidPath(format!(
                "Checkpoint metadata not found: {:?}",
                metadata_path
            )));
        }
        let metadata = CheckpointMetadata::from_path(&metadata_path)?;
        let classifier = OnnxClassifier::from_file(&model_path, intra_threads)?;
        Self::from_parts(classifier, metadata)
    }
}

impl<C: Classifier> LeafModel<C> {
    pub fn from_parts(classifier: C, metadata: CheckpointMetadata) -> Result<Self, ModelError> {
        let labels = LabelMap::new(metadata.class_to_idx, metadata.idx_to_class)?;
        let preprocessor = Preprocessor::new(&metadata.preprocessing)?;
        let model_version = metadata
            .model_version
            .unwrap_or_else(|| format!("epoch-{}", metadata.epochs));

        let model = Self {
            classifier,
            labels,
            preprocessor,
            epochs: metadata.epochs,
            model_version,
        };
        tracing::info!(
            classes = model.labels().len(),
            epochs = model.epochs(),
            model_version = model.model_version(),
            crop = ?model.preprocessor().crop_box(),
            normalization = ?model.preprocessor().normalization(),
            "checkpoint loaded"
        );
        Ok(model)
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn epochs(&self) -> u32 {
        self.epochs
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Preprocesses `image` and returns its `k` most probable classes.
    pub fn predict(&self, image: &DynamicImage, k: usize) -> Result<Vec<Prediction>, ModelError> {
        self.check_top_k(k)?;
        let batch = self.preprocessor.preprocess_batch(image);
        self.predict_tensor(batch.view(), k)
    }

    /// Runs an already preprocessed `1×3×H×W` batch.
    pub fn predict_tensor(
        &self,
        batch: ArrayView4<'_, f32>,
        k: usize,
    ) -> Result<Vec<Prediction>, ModelError> {
        self.check_top_k(k)?;

        let (channels, height, width) = self.preprocessor.output_shape();
        let expected = [1, channels, height, width];
        if batch.shape() != expected {
            return Err(ModelError::InputShapeMismatch {
                expected: expected.to_vec(),
                actual: batch.shape().to_vec(),
            });
        }

        let log_probabilities = self.classifier.forward(batch)?;
        let num_classes = self.labels.len();
        if log_probabilities.dim() != (1, num_classes) {
            return Err(ModelError::OutputFormatUnexpected(format!(
                "expected output of shape [1, {num_classes}], got {:?}",
                log_probabilities.shape()
            )));
        }

        let probabilities: Vec<f32> = log_probabilities.row(0).iter().map(|v| v.exp()).collect();
        top_k(&probabilities, k)
            .into_iter()
            .map(|(class_index, probability)| {
                let label = self.labels.label(class_index).ok_or_else(|| {
                    ModelError::OutputFormatUnexpected(format!("no label for class {class_index}"))
                })?;
                Ok(Prediction {
                    class_index,
                    label: label.to_string(),
                    probability,
                })
            })
            .collect()
    }

    fn check_top_k(&self, k: usize) -> Result<(), ModelError> {
        let num_classes = self.labels.len();
        if k == 0 || k > num_classes {
            return Err(ModelError::InvalidTopK { k, num_classes });
        }
        Ok(())
    }
}

/// The `k` largest values with their indices, largest first. Equal values
/// keep index order.
pub fn top_k(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.truncate(k);
    indexed
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::BTreeMap;

    pub const CLASSES: [&str; 4] = ["Blight", "Common_Rust", "Gray_Leaf_Spot", "Healthy"];

    /// Returns the same log-probabilities for every input.
    pub struct FixedLogProbs(pub Vec<f32>);

    impl Classifier for FixedLogProbs {
        fn forward(&self, _batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, ModelError> {
            Array2::from_shape_vec((1, self.0.len()), self.0.clone())
                .map_err(|e| ModelError::OutputFormatUnexpected(e.to_string()))
        }
    }

    pub fn metadata() -> CheckpointMetadata {
        CheckpointMetadata {
            class_to_idx: CLASSES
                .iter()
                .enumerate()
                .map(|(idx, label)| (label.to_string(), idx))
                .collect(),
            idx_to_class: Some(
                CLASSES
                    .iter()
                    .enumerate()
                    .map(|(idx, label)| (idx, label.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            epochs: 4,
            model_version: Some("resnet50-transfer-4".to_string()),
            preprocessing: Default::default(),
        }
    }

    /// Probabilities 0.1, 0.6, 0.05, 0.25 over [`CLASSES`].
    pub fn model() -> LeafModel<FixedLogProbs> {
        let log_probs = [0.1f32, 0.6, 0.05, 0.25].iter().map(|p| p.ln()).collect();
        LeafModel::from_parts(FixedLogProbs(log_probs), metadata()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::Array4;

    fn leaf_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(320, 240, |x, y| {
            Rgb([(x / 2) as u8, 120, (y / 2) as u8])
        }))
    }

    #[test]
    fn test_predict_returns_top_three_in_order() {
        let model = model();
        let predictions = model.predict(&leaf_image(), DEFAULT_TOP_K).unwrap();

        assert_eq!(predictions.len(), 3);
        let labels: Vec<&str> = predictions.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, ["Common_Rust", "Healthy", "Blight"]);
        assert_eq!(
            predictions.iter().map(|p| p.class_index).collect::<Vec<_>>(),
            [1, 3, 0]
        );
        assert!(predictions.windows(2).all(|w| w[0].probability >= w[1].probability));
        assert!((predictions[0].probability - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_inference_is_bit_identical() {
        let model = model();
        let batch = model.preprocessor().preprocess_batch(&leaf_image());
        let first = model.predict_tensor(batch.view(), 3).unwrap();
        let second = model.predict_tensor(batch.view(), 3).unwrap();
        assert_eq!(first, second);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.probability.to_bits(), b.probability.to_bits());
        }
    }

    #[test]
    fn test_top_k_out_of_range_is_rejected() {
        let model = model();
        let image = leaf_image();
        assert!(matches!(
            model.predict(&image, 0),
            Err(ModelError::InvalidTopK { k: 0, num_classes: 4 })
        ));
        assert!(matches!(
            model.predict(&image, 5),
            Err(ModelError::InvalidTopK { k: 5, num_classes: 4 })
        ));
        assert_eq!(model.predict(&image, 4).unwrap().len(), 4);
    }

    #[test]
    fn test_wrong_input_shape_is_rejected() {
        let model = model();
        let batch = Array4::<f32>::zeros((1, 3, 256, 256));
        assert!(matches!(
            model.predict_tensor(batch.view(), 3),
            Err(ModelError::InputShapeMismatch { .. })
        ));
        let batch = Array4::<f32>::zeros((2, 3, 224, 224));
        assert!(matches!(
            model.predict_tensor(batch.view(), 3),
            Err(ModelError::InputShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_output_width_must_match_labels() {
        let model = LeafModel::from_parts(FixedLogProbs(vec![0.0; 3]), metadata()).unwrap();
        assert!(matches!(
            model.predict(&leaf_image(), 3),
            Err(ModelError::OutputFormatUnexpected(_))
        ));
    }

    #[test]
    fn test_top_k_orders_and_breaks_ties_by_index() {
        let ranked = top_k(&[0.2, 0.5, 0.2, 0.1], 3);
        assert_eq!(ranked, vec![(1, 0.5), (0, 0.2), (2, 0.2)]);
        assert_eq!(top_k(&[0.3, 0.7], 5).len(), 2);
    }

    #[test]
    fn test_model_version_defaults_to_epochs() {
        let mut metadata = metadata();
        metadata.model_version = None;
        let model = LeafModel::from_parts(FixedLogProbs(vec![0.0; 4]), metadata).unwrap();
        assert_eq!(model.model_version(), "epoch-4");
        assert_eq!(model.epochs(), 4);
    }

    #[test]
    fn test_load_fails_without_checkpoint_files() {
        let result = LeafModel::load(Path::new("/nonexistent/leaf-model"), 1);
        assert!(matches!(result, Err(ModelError::InvalidPath(_))));
    }
}

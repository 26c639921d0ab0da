mod config;
mod image_source;
mod leaf_model;
mod model_config;
mod preprocess;

use std::sync::Arc;

use tonic::{transport::Server, Code, Request, Response, Status};
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use image_source::{decode_image, fetch_image};
use leaf_model::{Classifier, LeafModel, ModelError, Prediction};

// Generated from proto/leaf_disease.proto.
pub mod leaf_disease_service {
    tonic::include_proto!("leaf_disease_service");
    pub(crate) const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("leaf_disease_descriptor");
}

use leaf_disease_service::{
    detection_request::ImageSource,
    leaf_disease_detector_server::{LeafDiseaseDetector, LeafDiseaseDetectorServer},
    ClassPrediction, DetectionRequest, DetectionResponse, ListClassesRequest, ListClassesResponse,
};

impl From<ModelError> for Status {
    fn from(error: ModelError) -> Self {
        let code = match &error {
            ModelError::ImageProcessing(_)
            | ModelError::UnsupportedFormat(_)
            | ModelError::ImageTooLarge { .. }
            | ModelError::InvalidTopK { .. }
            | ModelError::InputShapeMismatch { .. } => Code::InvalidArgument,
            ModelError::Fetch(_) => Code::Unavailable,
            _ => Code::Internal,
        };
        Status::new(code, error.to_string())
    }
}

impl From<Prediction> for ClassPrediction {
    fn from(prediction: Prediction) -> Self {
        Self {
            label: prediction.label,
            probability: prediction.probability,
            class_index: prediction.class_index as u32,
        }
    }
}

/// Room for the protobuf fields around `image_data`.
const MESSAGE_ENVELOPE_SLACK: usize = 64 * 1024;

pub struct LeafDiseaseDetectorService<C> {
    model: Arc<LeafModel<C>>,
    http: reqwest::Client,
    default_top_k: usize,
    max_image_bytes: usize,
}

impl<C: Classifier> LeafDiseaseDetectorService<C> {
    pub fn new(model: Arc<LeafModel<C>>, config: &ServerConfig) -> Self {
        Self {
            model,
            http: reqwest::Client::new(),
            default_top_k: config.default_top_k,
            max_image_bytes: config.max_image_bytes,
        }
    }

    /// Wraps the service so inline images up to `max_image_bytes` reach the
    /// handler instead of tripping tonic's default 4 MiB decoding limit.
    pub fn into_server(self) -> LeafDiseaseDetectorServer<Self>
    where
        C: 'static,
    {
        let max_message_bytes = self.max_image_bytes.saturating_add(MESSAGE_ENVELOPE_SLACK);
        LeafDiseaseDetectorServer::new(self).max_decoding_message_size(max_message_bytes)
    }
}

#[tonic::async_trait]
impl<C: Classifier + 'static> LeafDiseaseDetector for LeafDiseaseDetectorService<C> {
    async fn detect_disease(
        &self,
        request: Request<DetectionRequest>,
    ) -> Result<Response<DetectionResponse>, Status> {
        let request = request.into_inner();
        let request_id = request.request_id;
        tracing::debug!(%request_id, "received detection request");

        let image_bytes = match request.image_source {
            Some(ImageSource::ImageData(data)) if !data.is_empty() => data,
            Some(ImageSource::ImageUrl(url)) if !url.is_empty() => {
                fetch_image(&self.http, &url, self.max_image_bytes).await?
            }
            _ => {
                tracing::warn!(%request_id, "request carried no image");
                return Ok(Response::new(DetectionResponse {
                    request_id,
                    predictions: Vec::new(),
                    model_version: self.model.model_version().to_string(),
                    error_message: "No valid image data provided".to_string(),
                }));
            }
        };

        let k = match request.top_k {
            0 => self.default_top_k,
            k => k as usize,
        };
        let model = Arc::clone(&self.model);
        let max_image_bytes = self.max_image_bytes;
        let predictions = tokio::task::spawn_blocking(move || {
            let image = decode_image(&image_bytes, max_image_bytes)?;
            model.predict(&image, k)
        })
        .await
        .map_err(|e| Status::internal(format!("inference task failed: {e}")))?
        .inspect_err(|e| tracing::warn!(%request_id, error = %e, "detection failed"))?;

        if let Some(top) = predictions.first() {
            tracing::info!(
                %request_id,
                label = %top.label,
                probability = top.probability,
                "leaf classified"
            );
        }

        Ok(Response::new(DetectionResponse {
            request_id,
            predictions: predictions.into_iter().map(ClassPrediction::from).collect(),
            model_version: self.model.model_version().to_string(),
            error_message: String::new(),
        }))
    }

    async fn list_classes(
        &self,
        _request: Request<ListClassesRequest>,
    ) -> Result<Response<ListClassesResponse>, Status> {
        Ok(Response::new(ListClassesResponse {
            labels: self.model.labels().labels().to_vec(),
            epochs: self.model.epochs(),
            model_version: self.model.model_version().to_string(),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!(model_dir = ?config.model_dir, "loading checkpoint");
    let model = Arc::new(LeafModel::load(&config.model_dir, config.intra_threads)?);
    let detector_service = LeafDiseaseDetectorService::new(model, &config);

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(leaf_disease_service::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    tracing::info!(addr = %config.listen_addr, "LeafDiseaseDetector listening");
    Server::builder()
        .add_service(detector_service.into_server())
        .add_service(reflection_service)
        .serve(config.listen_addr)
        .await?;

    Ok(())
}

//! Face embedder via ONNX Runtime.
//!
//! Crops the detected face region, resizes it to the model's square input
//! and extracts a fixed-dimension, L2-normalized embedding (FaceNet-style,
//! 160x160 input, 128-dim output by default).

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: u32 = 160;
pub const DEFAULT_EMBEDDING_DIM: usize = 128;
const DEFAULT_MODEL_VERSION: &str = "facenet";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("empty crop: {0}")]
    EmptyCrop(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a face region to a fixed-dimension embedding.
///
/// Must be deterministic: the same image and box always yield the same vector.
pub trait Embedder: Send {
    /// Dimension of every embedding this embedder produces.
    fn dim(&self) -> usize;

    fn embed(&mut self, image: &RgbImage, bbox: &BoundingBox) -> Result<Embedding, EmbedderError>;
}

/// Memory layout of the model's input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// [batch, height, width, channels] (Keras exports).
    Nhwc,
    /// [batch, channels, height, width] (PyTorch exports).
    Nchw,
}

/// Input geometry and normalization for an embedding model.
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub input_size: u32,
    pub layout: TensorLayout,
    /// Pixels are mapped to `(p - mean) / std`.
    pub mean: f32,
    pub std: f32,
    pub embedding_dim: usize,
    pub model_version: String,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            layout: TensorLayout::Nhwc,
            mean: 0.0,
            std: 255.0,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            model_version: DEFAULT_MODEL_VERSION.to_string(),
        }
    }
}

/// Crop `bbox` out of `image` and resize it to `size` x `size`.
///
/// The box is first clipped to the image; a box with no pixels inside the
/// image is an [`EmbedderError::EmptyCrop`].
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox, size: u32) -> Result<RgbImage, EmbedderError> {
    let clipped = bbox.clip_to(image.width(), image.height()).ok_or_else(|| {
        EmbedderError::EmptyCrop(format!(
            "box {bbox:?} outside {}x{} image",
            image.width(),
            image.height()
        ))
    })?;

    let crop = imageops::crop_imm(
        image,
        clipped.x1 as u32,
        clipped.y1 as u32,
        clipped.width() as u32,
        clipped.height() as u32,
    )
    .to_image();

    Ok(imageops::resize(&crop, size, size, FilterType::Triangle))
}

/// ONNX embedding model.
pub struct OnnxEmbedder {
    session: Session,
    config: EmbedderConfig,
}

impl OnnxEmbedder {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &Path, config: EmbedderConfig) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_size = config.input_size,
            dim = config.embedding_dim,
            "loaded embedding model"
        );

        Ok(Self { session, config })
    }

    /// Normalize a square face crop into a batch-of-one float tensor.
    fn preprocess(face: &RgbImage, config: &EmbedderConfig) -> Array4<f32> {
        let size = config.input_size as usize;
        let shape = match config.layout {
            TensorLayout::Nhwc => (1, size, size, 3),
            TensorLayout::Nchw => (1, 3, size, size),
        };
        let mut tensor = Array4::<f32>::zeros(shape);

        for (x, y, pixel) in face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = (pixel[c] as f32 - config.mean) / config.std;
                match config.layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                }
            }
        }

        tensor
    }
}

impl Embedder for OnnxEmbedder {
    fn dim(&self) -> usize {
        self.config.embedding_dim
    }

    fn embed(&mut self, image: &RgbImage, bbox: &BoundingBox) -> Result<Embedding, EmbedderError> {
        let face = crop_face(image, bbox, self.config.input_size)?;
        let input = Self::preprocess(&face, &self.config);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != self.config.embedding_dim {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.config.embedding_dim,
                raw_data.len()
            )));
        }

        let mut embedding = Embedding {
            values: raw_data.to_vec(),
            model_version: Some(self.config.model_version.clone()),
        };
        embedding.l2_normalize();
        Ok(embedding)
    }
}

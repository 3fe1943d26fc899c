//! facematch-core — Face identity matching pipeline.
//!
//! Detects faces (SCRFD via ONNX Runtime, or a SeetaFace cascade), extracts
//! fixed-length embeddings, and matches them against a gallery of enrolled
//! identities by cosine similarity or by a trained classifier.

pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod image_io;
pub mod matcher;
pub mod pipeline;
pub mod types;

pub use detector::{CascadeDetector, Detector, DetectorError, DetectorKind, ScrfdDetector};
pub use embedder::{Embedder, EmbedderConfig, EmbedderError, OnnxEmbedder, TensorLayout};
pub use gallery::{Gallery, GalleryError, GallerySnapshot, InMemoryGallery};
pub use image::RgbImage;
pub use image_io::{decode_image, load_image};
pub use matcher::{
    Classifier, ClassifierMatcher, ClassifierModel, LabelSet, LinearClassifier, MatchError,
    MatchStrategy, SimilarityMatcher, StrategyKind,
};
pub use pipeline::{Capability, Pipeline, PipelineConfig, PipelineError};
pub use types::{BoundingBox, Detection, Embedding, GalleryEntry, Identity, MatchResult};

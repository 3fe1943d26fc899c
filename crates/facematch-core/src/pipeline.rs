//! Detector -> Embedder -> Matcher orchestration.
//!
//! A [`Pipeline`] owns its model sessions and is built explicitly, either by
//! injecting components with [`Pipeline::new`] or from artifacts on disk with
//! [`Pipeline::load`]. Missing detector or embedder artifacts fail at load
//! time; a missing classifier leaves the pipeline running with its matching
//! strategy marked unavailable.
//!
//! Every call takes `&mut self`: inference sessions are not shared, so callers
//! that want parallelism across frames run one pipeline per worker.

use crate::detector::{self, Detector, DetectorError, DetectorKind, DEFAULT_MIN_CONFIDENCE};
use crate::embedder::{Embedder, EmbedderConfig, EmbedderError, OnnxEmbedder};
use crate::gallery::{Gallery, GalleryError};
use crate::matcher::{
    ClassifierMatcher, ClassifierModel, MatchError, MatchStrategy, SimilarityMatcher, StrategyKind,
    DEFAULT_CLASSIFIER_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD,
};
use crate::types::{validate_identity, Detection, GalleryEntry, InvalidIdentity, MatchResult};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const EMBEDDER_MODEL_FILE: &str = "facenet.onnx";
const CLASSIFIER_FILE: &str = "classifier.json";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("failed to read image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{kind} matcher unavailable: {reason}")]
    ModelUnavailable { kind: StrategyKind, reason: String },
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] InvalidIdentity),
    #[error("detector error: {0}")]
    Detector(DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("matcher error: {0}")]
    Match(#[from] MatchError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
}

impl From<DetectorError> for PipelineError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::InvalidImage(reason) => PipelineError::InvalidImage(reason),
            other => PipelineError::Detector(other),
        }
    }
}

impl PipelineError {
    /// Errors confined to one face: the face is skipped, the frame continues.
    pub fn is_face_local(&self) -> bool {
        matches!(
            self,
            PipelineError::Embedder(EmbedderError::EmptyCrop(_))
                | PipelineError::Match(MatchError::DimensionMismatch { .. })
        )
    }
}

/// Artifact locations and policy values for [`Pipeline::load`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub detector: DetectorKind,
    pub detector_model: PathBuf,
    pub min_detection_confidence: f32,
    pub embedder_model: PathBuf,
    pub embedder: EmbedderConfig,
    pub strategy: StrategyKind,
    pub classifier_model: PathBuf,
    pub similarity_threshold: f32,
    pub classifier_threshold: f32,
}

impl PipelineConfig {
    /// Default artifact names inside `model_dir`.
    pub fn with_model_dir(model_dir: &Path, detector: DetectorKind, strategy: StrategyKind) -> Self {
        Self {
            detector,
            detector_model: model_dir.join(detector.model_file()),
            min_detection_confidence: DEFAULT_MIN_CONFIDENCE,
            embedder_model: model_dir.join(EMBEDDER_MODEL_FILE),
            embedder: EmbedderConfig::default(),
            strategy,
            classifier_model: model_dir.join(CLASSIFIER_FILE),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            classifier_threshold: DEFAULT_CLASSIFIER_THRESHOLD,
        }
    }
}

/// What a loaded pipeline can do, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct Capability {
    pub detector: &'static str,
    pub embedding_dim: usize,
    pub strategy: String,
    pub available: bool,
    pub unavailable_reason: Option<String>,
}

/// Face identity matching pipeline.
pub struct Pipeline {
    detector: Box<dyn Detector>,
    embedder: Box<dyn Embedder>,
    strategy: MatchStrategy,
}

impl Pipeline {
    pub fn new(detector: Box<dyn Detector>, embedder: Box<dyn Embedder>, strategy: MatchStrategy) -> Self {
        match &strategy {
            MatchStrategy::Unavailable { kind, reason } => {
                tracing::error!(strategy = %kind, reason = %reason, "matching strategy unavailable");
            }
            available => {
                tracing::info!(
                    detector = detector.name(),
                    dim = embedder.dim(),
                    strategy = %available.kind(),
                    "pipeline ready"
                );
            }
        }
        Self {
            detector,
            embedder,
            strategy,
        }
    }

    /// Load all artifacts named by `config`.
    ///
    /// Fails if the detector or embedder cannot be loaded. Classifier problems
    /// degrade the strategy to [`MatchStrategy::Unavailable`] instead.
    pub fn load(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let detector = detector::load_detector(
            config.detector,
            &config.detector_model,
            config.min_detection_confidence,
        )?;
        let embedder = OnnxEmbedder::load(&config.embedder_model, config.embedder.clone())?;
        let strategy = build_strategy(config, embedder.dim());
        Ok(Self::new(detector, Box::new(embedder), strategy))
    }

    pub fn strategy(&self) -> &MatchStrategy {
        &self.strategy
    }

    pub fn capability(&self) -> Capability {
        let unavailable_reason = match &self.strategy {
            MatchStrategy::Unavailable { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Capability {
            detector: self.detector.name(),
            embedding_dim: self.embedder.dim(),
            strategy: self.strategy.kind().to_string(),
            available: self.strategy.is_available(),
            unavailable_reason,
        }
    }

    /// Identify every face in `image`.
    ///
    /// Results follow the detector's order. Faces that fail with a face-local
    /// error are left out with a warning. `gallery` is only consulted by the
    /// similarity strategy; `threshold` overrides the strategy's default.
    pub fn recognize(
        &mut self,
        image: &RgbImage,
        gallery: &[GalleryEntry],
        threshold: Option<f32>,
    ) -> Result<Vec<MatchResult>, PipelineError> {
        if let MatchStrategy::Unavailable { kind, reason } = &self.strategy {
            return Err(PipelineError::ModelUnavailable {
                kind: *kind,
                reason: reason.clone(),
            });
        }

        let detections = self.detector.detect(image)?;
        let mut results = Vec::with_capacity(detections.len());

        for (index, detection) in detections.iter().enumerate() {
            match self.match_face(image, detection, gallery, threshold) {
                Ok(result) => results.push(result),
                Err(e) if e.is_face_local() => {
                    tracing::warn!(face = index, bbox = ?detection.bbox, error = %e, "skipping face");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            detected = detections.len(),
            recognized = results.iter().filter(|r| r.identity.is_known()).count(),
            "recognition complete"
        );
        Ok(results)
    }

    fn match_face(
        &mut self,
        image: &RgbImage,
        detection: &Detection,
        gallery: &[GalleryEntry],
        threshold: Option<f32>,
    ) -> Result<MatchResult, PipelineError> {
        let embedding = self.embedder.embed(image, &detection.bbox)?;
        match &self.strategy {
            MatchStrategy::Similarity(matcher) => Ok(matcher.compare(&embedding, gallery, detection, threshold)),
            MatchStrategy::Classifier(matcher) => Ok(matcher.compare(&embedding, detection, threshold)?),
            MatchStrategy::Unavailable { kind, reason } => Err(PipelineError::ModelUnavailable {
                kind: *kind,
                reason: reason.clone(),
            }),
        }
    }

    /// Build a gallery entry for `identity` from the first detected face.
    ///
    /// Zero faces is [`PipelineError::NoFaceDetected`]. The returned entry is
    /// not stored anywhere; see [`Pipeline::enroll_into`].
    pub fn enroll(&mut self, image: &RgbImage, identity: &str) -> Result<GalleryEntry, PipelineError> {
        let identity = validate_identity(identity)?;

        let detections = self.detector.detect(image)?;
        let face = detections.first().ok_or(PipelineError::NoFaceDetected)?;
        if detections.len() > 1 {
            tracing::warn!(
                faces = detections.len(),
                identity,
                "multiple faces in enrollment image; using the first detection"
            );
        }

        let embedding = self.embedder.embed(image, &face.bbox)?;
        let entry = GalleryEntry::new(identity, embedding)?;
        tracing::info!(id = %entry.id, identity, confidence = face.confidence, "enrollment embedding extracted");
        Ok(entry)
    }

    /// Enroll and append the entry to `gallery`. The gallery is untouched on error.
    pub fn enroll_into(
        &mut self,
        image: &RgbImage,
        identity: &str,
        gallery: &dyn Gallery,
    ) -> Result<GalleryEntry, PipelineError> {
        let entry = self.enroll(image, identity)?;
        gallery.add(entry.clone())?;

        if let MatchStrategy::Classifier(matcher) = &self.strategy {
            if matcher.model.labels().index_of(&entry.identity).is_none() {
                tracing::warn!(
                    identity = %entry.identity,
                    "identity is not in the classifier label set; retrain before it can be recognized"
                );
            }
        }
        Ok(entry)
    }
}

fn build_strategy(config: &PipelineConfig, embedding_dim: usize) -> MatchStrategy {
    match config.strategy {
        StrategyKind::Similarity => {
            MatchStrategy::Similarity(SimilarityMatcher::new(config.similarity_threshold))
        }
        StrategyKind::Classifier => match ClassifierModel::load(&config.classifier_model) {
            Ok(model) if model.input_dim() != embedding_dim => MatchStrategy::Unavailable {
                kind: StrategyKind::Classifier,
                reason: format!(
                    "classifier expects {}-dim input, embedder produces {embedding_dim}",
                    model.input_dim()
                ),
            },
            Ok(model) => MatchStrategy::Classifier(ClassifierMatcher::new(model, config.classifier_threshold)),
            Err(e) => MatchStrategy::Unavailable {
                kind: StrategyKind::Classifier,
                reason: e.to_string(),
            },
        },
    }
}

//! Identity matching strategies.
//!
//! Two interchangeable strategies decide who a face embedding belongs to:
//! nearest-neighbour cosine similarity against raw gallery embeddings, or the
//! probability output of a trained multi-class classifier. The active one is
//! fixed when the pipeline is built, see [`MatchStrategy`].

use crate::types::{Detection, Embedding, GalleryEntry, Identity, MatchResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;
pub const DEFAULT_CLASSIFIER_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid classifier: {0}")]
    InvalidClassifier(String),
    #[error("classifier artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("failed to read classifier artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse classifier artifact: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Nearest-neighbour matching by cosine similarity.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityMatcher {
    pub threshold: f32,
}

impl Default for SimilarityMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl SimilarityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Compare `probe` against every gallery entry and pick the best one.
    ///
    /// The first entry with the strictly highest similarity wins. It is a
    /// match only if its similarity is strictly greater than the threshold;
    /// otherwise the face is unknown and reports the detector confidence.
    /// Entries of the wrong dimension are skipped with a warning.
    pub fn compare(
        &self,
        probe: &Embedding,
        gallery: &[GalleryEntry],
        detection: &Detection,
        threshold: Option<f32>,
    ) -> MatchResult {
        let threshold = threshold.unwrap_or(self.threshold);
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let sim = match probe.similarity(&entry.embedding) {
                Ok(sim) => sim,
                Err(e) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        identity = %entry.identity,
                        error = %e,
                        "skipping gallery entry"
                    );
                    continue;
                }
            };
            if best.map_or(true, |(_, best_sim)| sim > best_sim) {
                best = Some((i, sim));
            }
        }

        match best {
            Some((idx, sim)) if sim > threshold => MatchResult {
                identity: Identity::Known(gallery[idx].identity.clone()),
                confidence: sim,
                bbox: detection.bbox,
                detection_confidence: detection.confidence,
                matched_entry_id: Some(gallery[idx].id.clone()),
            },
            _ => MatchResult {
                identity: Identity::Unknown,
                confidence: detection.confidence,
                bbox: detection.bbox,
                detection_confidence: detection.confidence,
                matched_entry_id: None,
            },
        }
    }
}

/// Ordered, duplicate-free identity labels; position is the class index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    pub fn new(labels: Vec<String>) -> Result<Self, MatchError> {
        if labels.is_empty() {
            return Err(MatchError::InvalidClassifier("label set is empty".into()));
        }
        let mut seen = HashSet::new();
        for label in &labels {
            if label.trim().is_empty() {
                return Err(MatchError::InvalidClassifier("blank label".into()));
            }
            if !seen.insert(label.as_str()) {
                return Err(MatchError::InvalidClassifier(format!("duplicate label: {label}")));
            }
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn identity(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, identity: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl TryFrom<Vec<String>> for LabelSet {
    type Error = MatchError;

    fn try_from(labels: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(labels)
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(set: LabelSet) -> Self {
        set.labels
    }
}

/// A trained multi-class model producing a probability per class.
pub trait Classifier: Send + Sync {
    fn num_classes(&self) -> usize;

    fn input_dim(&self) -> usize;

    /// Probability distribution over classes for one feature vector.
    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, MatchError>;
}

/// Linear model with a softmax over class scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearClassifier {
    /// One row of weights per class.
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

impl LinearClassifier {
    pub fn new(weights: Vec<Vec<f32>>, bias: Vec<f32>) -> Result<Self, MatchError> {
        let classifier = Self { weights, bias };
        classifier.validate()?;
        Ok(classifier)
    }

    fn validate(&self) -> Result<(), MatchError> {
        let Some(first) = self.weights.first() else {
            return Err(MatchError::InvalidClassifier("no classes".into()));
        };
        if first.is_empty() {
            return Err(MatchError::InvalidClassifier("zero-width weights".into()));
        }
        if self.weights.iter().any(|row| row.len() != first.len()) {
            return Err(MatchError::InvalidClassifier("ragged weight matrix".into()));
        }
        if self.bias.len() != self.weights.len() {
            return Err(MatchError::InvalidClassifier(format!(
                "{} bias terms for {} classes",
                self.bias.len(),
                self.weights.len()
            )));
        }
        Ok(())
    }
}

impl Classifier for LinearClassifier {
    fn num_classes(&self) -> usize {
        self.weights.len()
    }

    fn input_dim(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, MatchError> {
        if features.len() != self.input_dim() {
            return Err(MatchError::DimensionMismatch {
                expected: self.input_dim(),
                actual: features.len(),
            });
        }

        let logits: Vec<f32> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect();

        // Shift by the max logit so exp() cannot overflow.
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        Ok(exps.into_iter().map(|e| e / total).collect())
    }
}

/// On-disk classifier artifact written by the training collaborator.
#[derive(Debug, Deserialize)]
struct ClassifierArtifact {
    labels: LabelSet,
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

/// A classifier together with the label set it was trained on.
#[derive(Clone)]
pub struct ClassifierModel {
    labels: LabelSet,
    classifier: Arc<dyn Classifier>,
}

impl fmt::Debug for ClassifierModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierModel")
            .field("labels", &self.labels)
            .field("input_dim", &self.classifier.input_dim())
            .finish()
    }
}

impl ClassifierModel {
    pub fn new(labels: LabelSet, classifier: Arc<dyn Classifier>) -> Result<Self, MatchError> {
        if labels.len() != classifier.num_classes() {
            return Err(MatchError::InvalidClassifier(format!(
                "{} labels for {} classes",
                labels.len(),
                classifier.num_classes()
            )));
        }
        Ok(Self { labels, classifier })
    }

    /// Load a linear classifier artifact (JSON with `labels`, `weights`, `bias`).
    pub fn load(path: &Path) -> Result<Self, MatchError> {
        if !path.exists() {
            return Err(MatchError::ArtifactNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let artifact: ClassifierArtifact = serde_json::from_str(&raw)?;
        let classifier = LinearClassifier::new(artifact.weights, artifact.bias)?;

        tracing::info!(
            path = %path.display(),
            classes = artifact.labels.len(),
            input_dim = classifier.input_dim(),
            "loaded classifier"
        );

        Self::new(artifact.labels, Arc::new(classifier))
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn input_dim(&self) -> usize {
        self.classifier.input_dim()
    }
}

/// Matching by classifier probability.
#[derive(Debug, Clone)]
pub struct ClassifierMatcher {
    pub model: ClassifierModel,
    pub threshold: f32,
}

impl ClassifierMatcher {
    pub fn new(model: ClassifierModel, threshold: f32) -> Self {
        Self { model, threshold }
    }

    /// Classify `probe` and map the most probable class to its identity.
    ///
    /// A maximum probability below the threshold is unknown; a probability
    /// equal to the threshold is a match. Either way the confidence is the
    /// maximum probability. Ties resolve to the lowest class index.
    pub fn compare(
        &self,
        probe: &Embedding,
        detection: &Detection,
        threshold: Option<f32>,
    ) -> Result<MatchResult, MatchError> {
        let threshold = threshold.unwrap_or(self.threshold);
        let probabilities = self.model.classifier.predict_proba(&probe.values)?;
        if let Some(p) = probabilities.iter().find(|p| !p.is_finite()) {
            return Err(MatchError::InvalidClassifier(format!(
                "non-finite class probability: {p}"
            )));
        }

        let (best_idx, best_prob) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
            .ok_or_else(|| MatchError::InvalidClassifier("empty probability vector".into()))?;

        let identity = if best_prob < threshold {
            Identity::Unknown
        } else {
            let name = self.model.labels.identity(best_idx).ok_or_else(|| {
                MatchError::InvalidClassifier(format!("class index {best_idx} has no label"))
            })?;
            Identity::Known(name.to_string())
        };

        Ok(MatchResult {
            identity,
            confidence: best_prob,
            bbox: detection.bbox,
            detection_confidence: detection.confidence,
            matched_entry_id: None,
        })
    }
}

/// Which matching strategy a pipeline is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    Similarity,
    Classifier,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::Similarity => "similarity",
            StrategyKind::Classifier => "classifier",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "similarity" | "cosine" => Ok(StrategyKind::Similarity),
            "classifier" | "svm" => Ok(StrategyKind::Classifier),
            other => Err(format!("unknown matching strategy: {other}")),
        }
    }
}

/// The active matching strategy, decided once when the pipeline is built.
#[derive(Debug, Clone)]
pub enum MatchStrategy {
    Similarity(SimilarityMatcher),
    Classifier(ClassifierMatcher),
    /// The configured strategy could not be initialized.
    Unavailable { kind: StrategyKind, reason: String },
}

impl MatchStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            MatchStrategy::Similarity(_) => StrategyKind::Similarity,
            MatchStrategy::Classifier(_) => StrategyKind::Classifier,
            MatchStrategy::Unavailable { kind, .. } => *kind,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, MatchStrategy::Unavailable { .. })
    }
}

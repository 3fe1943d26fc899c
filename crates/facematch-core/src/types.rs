use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Label reported for a face that matched no enrolled identity.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Axis-aligned face region in source-image pixel coordinates.
///
/// Always non-empty: `x2 > x1` and `y2 > y1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Build a box from corner coordinates, rejecting empty areas.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        (x2 > x1 && y2 > y1).then_some(Self { x1, y1, x2, y2 })
    }

    /// Build a box from a top-left corner plus width and height.
    pub fn from_xywh(x: i32, y: i32, width: i32, height: i32) -> Option<Self> {
        Self::new(x, y, x.saturating_add(width), y.saturating_add(height))
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter_w = (ix2 - ix1).max(0) as i64;
        let inter_h = (iy2 - iy1).max(0) as i64;
        let inter_area = inter_w * inter_h;

        let union_area = self.area() + other.area() - inter_area;
        if union_area > 0 {
            inter_area as f32 / union_area as f32
        } else {
            0.0
        }
    }

    /// Intersect the box with a `width` × `height` image.
    ///
    /// Returns `None` when no pixels of the box lie inside the image.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        Self::new(
            self.x1.clamp(0, w),
            self.y1.clamp(0, h),
            self.x2.clamp(0, w),
            self.y2.clamp(0, h),
        )
    }
}

/// A face candidate produced by a detector for a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Two embeddings of different dimension were compared.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: {left} vs {right}")]
pub struct DimensionMismatch {
    pub left: usize,
    pub right: usize,
}

/// Face embedding vector (dimension fixed by the embedder, e.g. 128 for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector is
    /// similar to nothing and yields 0.0.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        self.check_dim(other)?;

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        Ok(if denom > 0.0 { dot / denom } else { 0.0 })
    }

    /// Scale to unit L2 norm in place. Zero vectors are left untouched.
    pub fn l2_normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
    }

    fn check_dim(&self, other: &Embedding) -> Result<(), DimensionMismatch> {
        if self.dim() == other.dim() {
            Ok(())
        } else {
            Err(DimensionMismatch {
                left: self.dim(),
                right: other.dim(),
            })
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidIdentity {
    #[error("identity label must not be empty")]
    Empty,
    #[error("identity label \"Unknown\" is reserved")]
    Reserved,
}

/// Trim an identity label and reject blank or reserved names.
pub fn validate_identity(identity: &str) -> Result<&str, InvalidIdentity> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(InvalidIdentity::Empty);
    }
    if identity == UNKNOWN_IDENTITY {
        return Err(InvalidIdentity::Reserved);
    }
    Ok(identity)
}

/// An enrolled identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: String,
    pub identity: String,
    pub embedding: Embedding,
    /// Source image the embedding was taken from, if known.
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GalleryEntry {
    /// Create a fresh entry with a random id and the current timestamp.
    pub fn new(identity: &str, embedding: Embedding) -> Result<Self, InvalidIdentity> {
        let identity = validate_identity(identity)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            embedding,
            image_path: None,
            created_at: Utc::now(),
        })
    }

    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = Some(path.into());
        self
    }
}

/// Outcome of matching one face: an enrolled identity or the unknown sentinel.
///
/// Serialized as a plain string; `"Unknown"` is reserved for the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identity::Known(name) => name,
            Identity::Unknown => UNKNOWN_IDENTITY,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Identity {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        Ok(if name == UNKNOWN_IDENTITY {
            Identity::Unknown
        } else {
            Identity::Known(name)
        })
    }
}

/// Decision for a single detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity: Identity,
    /// Similarity or class probability for a match. For an unknown face under
    /// the similarity strategy this is the detector confidence instead.
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub detection_confidence: f32,
    /// Id of the gallery entry that matched (similarity strategy only).
    pub matched_entry_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_bbox_rejects_empty_area() {
        assert!(BoundingBox::new(10, 10, 10, 20).is_none());
        assert!(BoundingBox::new(10, 10, 20, 5).is_none());
        assert!(BoundingBox::new(0, 0, 1, 1).is_some());
    }

    #[test]
    fn test_bbox_from_xywh() {
        let b = BoundingBox::from_xywh(5, 6, 10, 20).unwrap();
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (5, 6, 15, 26));
        assert_eq!(b.width(), 10);
        assert_eq!(b.height(), 20);
        assert!(BoundingBox::from_xywh(5, 6, 0, 20).is_none());
    }

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(0, 0, 100, 100).unwrap();
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0, 0, 10, 10).unwrap();
        let b = BoundingBox::new(20, 20, 30, 30).unwrap();
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::new(0, 0, 10, 10).unwrap();
        let b = BoundingBox::new(5, 0, 15, 10).unwrap();
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_partially_outside() {
        let b = BoundingBox::new(-10, -5, 50, 40).unwrap();
        let clipped = b.clip_to(32, 32).unwrap();
        assert_eq!(clipped, BoundingBox::new(0, 0, 32, 32).unwrap());
    }

    #[test]
    fn test_clip_fully_outside() {
        let b = BoundingBox::new(100, 100, 120, 120).unwrap();
        assert!(b.clip_to(64, 64).is_none());
        let b = BoundingBox::new(-20, -20, -1, -1).unwrap();
        assert!(b.clip_to(64, 64).is_none());
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b).unwrap(), 0.0);
    }

    #[test]
    fn test_similarity_dimension_mismatch() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert_eq!(
            a.similarity(&b),
            Err(DimensionMismatch { left: 2, right: 3 })
        );
    }

    #[test]
    fn test_l2_normalize() {
        let mut a = emb(&[3.0, 4.0]);
        a.l2_normalize();
        assert!((a.values[0] - 0.6).abs() < 1e-6);
        assert!((a.values[1] - 0.8).abs() < 1e-6);

        let mut z = emb(&[0.0, 0.0]);
        z.l2_normalize();
        assert_eq!(z.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_gallery_entry_rejects_blank_identity() {
        assert_eq!(
            GalleryEntry::new("   ", emb(&[1.0])).unwrap_err(),
            InvalidIdentity::Empty
        );
        assert_eq!(
            GalleryEntry::new("Unknown", emb(&[1.0])).unwrap_err(),
            InvalidIdentity::Reserved
        );
        let entry = GalleryEntry::new(" Alice ", emb(&[1.0])).unwrap();
        assert_eq!(entry.identity, "Alice");
        assert!(!entry.id.is_empty());
    }

    #[test]
    fn test_identity_display_and_serde() {
        assert_eq!(Identity::Unknown.to_string(), "Unknown");
        assert_eq!(Identity::Known("Bob".into()).to_string(), "Bob");

        let json = serde_json::to_string(&Identity::Unknown).unwrap();
        assert_eq!(json, "\"Unknown\"");
        let json = serde_json::to_string(&Identity::Known("Bob".into())).unwrap();
        assert_eq!(json, "\"Bob\"");

        let back: Identity = serde_json::from_str("\"Unknown\"").unwrap();
        assert_eq!(back, Identity::Unknown);
        let back: Identity = serde_json::from_str("\"Bob\"").unwrap();
        assert_eq!(back, Identity::Known("Bob".into()));
    }
}

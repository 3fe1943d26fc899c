//! Face detectors.
//!
//! Two interchangeable implementations of [`Detector`]:
//!
//! - [`ScrfdDetector`]: SCRFD via ONNX Runtime, 3-stride anchor-free decoding
//!   with NMS post-processing. Emits five-point landmarks.
//! - [`CascadeDetector`]: SeetaFace funnel-structured cascade via `rustface`.
//!   Faster, lower recall, no landmarks.

use crate::types::{BoundingBox, Detection};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Default confidence floor; weaker detections are discarded, not surfaced.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.9;

// --- SCRFD constants ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

// --- SeetaFace cascade constants ---
const CASCADE_MIN_FACE_SIZE: u32 = 20;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;
/// The cascade score is unbounded, so accepted boxes report a fixed confidence.
const CASCADE_CONFIDENCE: f32 = 0.95;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid model {path}: {reason}")]
    InvalidModel { path: String, reason: String },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("confidence floor must be within [0, 1], got {0}")]
    InvalidConfidence(f32),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates candidate face regions in an RGB frame.
///
/// Implementations must return an empty list (not an error) for a well-formed
/// image without faces, and must drop detections under their confidence floor.
/// `detect` takes `&mut self` because inference sessions are stateful; callers
/// that share a detector across threads must serialize access.
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;

    /// Short name for logs and capability reports.
    fn name(&self) -> &'static str;
}

/// Which detector implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorKind {
    #[default]
    Scrfd,
    Cascade,
}

impl DetectorKind {
    /// Default artifact file name inside the model directory.
    pub fn model_file(&self) -> &'static str {
        match self {
            DetectorKind::Scrfd => "det_10g.onnx",
            DetectorKind::Cascade => "seeta_fd_frontal_v1.0.bin",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorKind::Scrfd => "scrfd",
            DetectorKind::Cascade => "cascade",
        })
    }
}

impl FromStr for DetectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrfd" => Ok(DetectorKind::Scrfd),
            "cascade" | "seetaface" => Ok(DetectorKind::Cascade),
            other => Err(format!("unknown detector kind: {other}")),
        }
    }
}

/// Load the detector selected by `kind`.
pub fn load_detector(
    kind: DetectorKind,
    model_path: &Path,
    min_confidence: f32,
) -> Result<Box<dyn Detector>, DetectorError> {
    Ok(match kind {
        DetectorKind::Scrfd => Box::new(ScrfdDetector::load(model_path, min_confidence)?),
        DetectorKind::Cascade => Box::new(CascadeDetector::load(model_path, min_confidence)?),
    })
}

fn check_confidence(min_confidence: f32) -> Result<(), DetectorError> {
    if (0.0..=1.0).contains(&min_confidence) {
        Ok(())
    } else {
        Err(DetectorError::InvalidConfidence(min_confidence))
    }
}

fn check_image(image: &RgbImage) -> Result<(), DetectorError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(DetectorError::InvalidImage(format!(
            "zero-sized frame {}x{}",
            image.width(),
            image.height()
        )));
    }
    Ok(())
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    min_confidence: f32,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, min_confidence: f32) -> Result<Self, DetectorError> {
        check_confidence(min_confidence)?;
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InvalidModel {
                path: model_path.display().to_string(),
                reason: format!(
                    "SCRFD requires 9 outputs (3 strides × score/bbox/kps), got {}",
                    output_names.len()
                ),
            });
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            min_confidence,
            stride_indices,
        })
    }

    /// Resize an RGB frame into a letterboxed NCHW float tensor.
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let width = image.width() as usize;
        let height = image.height() as usize;

        let scale_w = self.input_width as f32 / width as f32;
        let scale_h = self.input_height as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = ((width as f32 * scale).round() as usize).clamp(1, self.input_width);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, self.input_height);
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let resized = imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        // Padding is left at 0.0, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = x as usize + pad_x_start;
            let ty = y as usize + pad_y_start;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl Detector for ScrfdDetector {
    /// Detect faces, returning detections sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        check_image(image)?;
        let (input, letterbox) = self.preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            let grid = StrideGrid {
                stride,
                width: self.input_width / stride,
                height: self.input_height / stride,
            };
            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                &grid,
                &letterbox,
                self.min_confidence,
            ));
        }

        let result = nms(all_detections, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = result.len(), "SCRFD detection complete");
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "scrfd"
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name tensors "score_8", "bbox_16", ... or use generic
/// numeric names. Unrecognized names fall back to the standard positional
/// ordering: [0-2] scores, [3-5] bboxes, [6-8] kps (strides 8, 16, 32).
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Anchor grid geometry for one stride level.
struct StrideGrid {
    stride: usize,
    width: usize,
    height: usize,
}

/// Decode detections for a single stride level, dropping scores under `floor`.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    grid: &StrideGrid,
    letterbox: &LetterboxInfo,
    floor: f32,
) -> Vec<Detection> {
    let stride = grid.stride as f32;
    let num_anchors = grid.height * grid.width * SCRFD_ANCHORS_PER_CELL;
    let unmap = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score.is_nan() || score < floor {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid.width) as f32 * stride;
        let anchor_cy = (anchor_idx / grid.width) as f32 * stride;

        let Some(off) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = unmap(anchor_cx - off[0] * stride, anchor_cy - off[1] * stride);
        let (x2, y2) = unmap(anchor_cx + off[2] * stride, anchor_cy + off[3] * stride);

        let Some(bbox) = BoundingBox::new(
            x1.round() as i32,
            y1.round() as i32,
            x2.round() as i32,
            y2.round() as i32,
        ) else {
            continue;
        };

        let landmarks: Option<[(f32, f32); 5]> = kps.get(idx * 10..idx * 10 + 10).map(|pts| {
            std::array::from_fn(|i| {
                unmap(
                    anchor_cx + pts[i * 2] * stride,
                    anchor_cy + pts[i * 2 + 1] * stride,
                )
            })
        });

        detections.push(Detection {
            bbox,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: keep the strongest of each overlapping cluster.
///
/// Output is sorted by descending confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// SeetaFace cascade detector backed by the `rustface` crate.
pub struct CascadeDetector {
    model: rustface::Model,
    min_confidence: f32,
}

impl CascadeDetector {
    /// Load a SeetaFace frontal model (`seeta_fd_frontal_v1.0.bin`).
    pub fn load(model_path: &Path, min_confidence: f32) -> Result<Self, DetectorError> {
        check_confidence(min_confidence)?;
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let file = std::fs::File::open(model_path).map_err(|e| DetectorError::InvalidModel {
            path: model_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let model = rustface::read_model(std::io::BufReader::new(file)).map_err(|e| {
            DetectorError::InvalidModel {
                path: model_path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!(path = %model_path.display(), "loaded SeetaFace cascade model");

        Ok(Self {
            model,
            min_confidence,
        })
    }
}

impl Detector for CascadeDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        check_image(image)?;

        if CASCADE_CONFIDENCE < self.min_confidence {
            tracing::warn!(
                floor = self.min_confidence,
                "cascade confidence is below the floor; every face will be dropped"
            );
            return Ok(Vec::new());
        }

        let gray = imageops::grayscale(image);

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(CASCADE_MIN_FACE_SIZE);
        detector.set_score_thresh(CASCADE_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
        detector.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);

        let faces = detector.detect(&rustface::ImageData::new(
            gray.as_raw(),
            gray.width(),
            gray.height(),
        ));

        let detections: Vec<Detection> = faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                let bbox = BoundingBox::from_xywh(
                    bbox.x(),
                    bbox.y(),
                    bbox.width() as i32,
                    bbox.height() as i32,
                )?;
                Some(Detection {
                    bbox,
                    confidence: CASCADE_CONFIDENCE,
                    landmarks: None,
                })
            })
            .collect();

        tracing::debug!(faces = detections.len(), "cascade detection complete");
        Ok(detections)
    }

    fn name(&self) -> &'static str {
        "cascade"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_det(x: i32, y: i32, w: i32, h: i32, conf: f32) -> Detection {
        Detection {
            bbox: BoundingBox::from_xywh(x, y, w, h).unwrap(),
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_det(5, 5, 100, 100, 0.8),
            make_det(0, 0, 100, 100, 0.95),
            make_det(200, 200, 50, 50, 0.91),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.95).abs() < 1e-6);
        assert!((result[1].confidence - 0.91).abs() < 1e-6);
    }

    #[test]
    fn test_nms_no_suppression() {
        let detections = vec![make_det(0, 0, 10, 10, 0.9), make_det(50, 50, 10, 10, 0.8)];
        assert_eq!(nms(detections, 0.4).len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8", "bbox_16", "bbox_32",
            "kps_8", "kps_16", "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(
            discover_output_indices(&names),
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        );
    }

    fn identity_letterbox() -> LetterboxInfo {
        LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        }
    }

    #[test]
    fn test_decode_stride_applies_confidence_floor() {
        // 2x2 grid, 2 anchors per cell = 8 anchors.
        let grid = StrideGrid { stride: 8, width: 2, height: 2 };
        let mut scores = vec![0.0f32; 8];
        scores[0] = 0.95;
        scores[3] = 0.85;
        let bboxes = vec![1.0f32; 8 * 4];
        let kps = vec![0.0f32; 8 * 10];

        let dets = decode_stride(&scores, &bboxes, &kps, &grid, &identity_letterbox(), 0.9);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.95).abs() < 1e-6);
        // Anchor (0, 0) with unit offsets at stride 8 -> [-8, -8, 8, 8].
        assert_eq!(dets[0].bbox, BoundingBox::new(-8, -8, 8, 8).unwrap());
        assert!(dets[0].landmarks.is_some());
    }

    #[test]
    fn test_decode_stride_drops_nan_scores() {
        let grid = StrideGrid { stride: 8, width: 2, height: 2 };
        let mut scores = vec![0.0f32; 8];
        scores[0] = f32::NAN;
        scores[2] = 0.97;
        let bboxes = vec![1.0f32; 8 * 4];

        let dets = decode_stride(&scores, &bboxes, &[], &grid, &identity_letterbox(), 0.9);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.97).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_unmaps_letterbox() {
        let grid = StrideGrid { stride: 8, width: 2, height: 2 };
        let mut scores = vec![0.0f32; 8];
        // anchor_idx 3 -> cell (1, 1) -> center (8, 8)
        scores[6] = 0.99;
        let bboxes = vec![1.0f32; 8 * 4];
        let letterbox = LetterboxInfo {
            scale: 2.0,
            pad_x: 4.0,
            pad_y: 0.0,
        };

        let dets = decode_stride(&scores, &bboxes, &[], &grid, &letterbox, 0.9);
        assert_eq!(dets.len(), 1);
        // Letterboxed [0, 0, 16, 16] -> original [(0-4)/2, 0, (16-4)/2, 8]
        assert_eq!(dets[0].bbox, BoundingBox::new(-2, 0, 6, 8).unwrap());
        // kps tensor too short -> no landmarks
        assert!(dets[0].landmarks.is_none());
    }

    #[test]
    fn test_detector_kind_parse() {
        assert_eq!("scrfd".parse::<DetectorKind>().unwrap(), DetectorKind::Scrfd);
        assert_eq!(" Cascade ".parse::<DetectorKind>().unwrap(), DetectorKind::Cascade);
        assert!("haar".parse::<DetectorKind>().is_err());
        assert_eq!(DetectorKind::Cascade.to_string(), "cascade");
    }

    #[test]
    fn test_load_missing_model() {
        let missing = Path::new("/nonexistent/det_10g.onnx");
        assert!(matches!(
            ScrfdDetector::load(missing, 0.9),
            Err(DetectorError::ModelNotFound(_))
        ));
        assert!(matches!(
            CascadeDetector::load(missing, 0.9),
            Err(DetectorError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_load_rejects_bad_floor() {
        let missing = Path::new("/nonexistent/det_10g.onnx");
        assert!(matches!(
            ScrfdDetector::load(missing, 1.5),
            Err(DetectorError::InvalidConfidence(_))
        ));
    }

    #[test]
    fn test_check_image_zero_sized() {
        let empty = RgbImage::new(0, 10);
        assert!(matches!(check_image(&empty), Err(DetectorError::InvalidImage(_))));
        assert!(check_image(&RgbImage::new(4, 4)).is_ok());
    }
}

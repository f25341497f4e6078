//! Face detection seam and the SCRFD implementation.
//!
//! SCRFD runs via ONNX Runtime on a 640×640 letterboxed copy of the frame,
//! decodes three anchor-free stride levels and suppresses overlaps with NMS.

use crate::types::{BoundingBox, DetectedFace, Keypoints};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces and their keypoints in a luma image.
pub trait FaceDetector {
    /// Detections sorted by descending confidence.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Letterbox placement of the frame inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((side - new_w) / 2.0).floor(),
            pad_y: ((side - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from model-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// Tunables for SCRFD post-processing.
#[derive(Debug, Clone, Copy)]
pub struct ScrfdOptions {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub intra_threads: usize,
}

impl Default for ScrfdOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            intra_threads: 2,
        }
    }
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    options: ScrfdOptions,
    strides: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, options: ScrfdOptions) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(options.intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                output_names.len()
            )));
        }

        let strides = map_outputs(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?strides, "loaded SCRFD model");

        Ok(Self {
            session,
            options,
            strides,
        })
    }

    /// Letterbox the frame into a normalized 1×3×640×640 tensor.
    fn preprocess(image: &GrayImage) -> (Array4<f32>, Letterbox) {
        let letterbox = Letterbox::fit(image.width(), image.height());
        let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).max(1);
        let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).max(1);
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let side = SCRFD_INPUT_SIZE as usize;
        let (px, py) = (letterbox.pad_x as u32, letterbox.pad_y as u32);
        // Padding normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = ((x + px) as usize, (y + py) as usize);
            if tx >= side || ty >= side {
                continue;
            }
            let v = (pixel[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let (input, letterbox) = Self::preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.strides[level];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let level_out = StrideLevel {
                stride,
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "boxes")?,
                kps: extract(kps_idx, "keypoints")?,
            };
            candidates.extend(level_out.decode(&letterbox, self.options.confidence_threshold));
        }

        let faces = nms(candidates, self.options.nms_threshold);
        tracing::debug!(count = faces.len(), "SCRFD detections");
        Ok(faces)
    }
}

/// Locate per-stride outputs by name (`score_8`, `bbox_16`, `kps_32`, ...),
/// falling back to the conventional positional layout
/// `[scores 8/16/32, boxes 8/16/32, kps 8/16/32]`.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut mapped = [(0, 0, 0); 3];
    for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => mapped[level] = (s, b, k),
            _ => {
                tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    mapped
}

/// Raw outputs of one stride level.
struct StrideLevel<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideLevel<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<DetectedFace> {
        let grid = SCRFD_INPUT_SIZE as usize / self.stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let step = self.stride as f32;

        let mut faces = Vec::new();
        for idx in 0..anchors.min(self.scores.len()) {
            let score = self.scores[idx];
            if score <= threshold {
                continue;
            }
            let Some(d) = self.boxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

            let keypoints = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                let pt = |i: usize| letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step);
                Keypoints {
                    left_eye: pt(0),
                    right_eye: pt(1),
                    nose: pt(2),
                    mouth_left: pt(3),
                    mouth_right: pt(4),
                }
            });

            faces.push(DetectedFace {
                bbox: BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                },
                confidence: score,
                keypoints,
            });
        }
        faces
    }
}

/// Non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut faces: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<DetectedFace> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| iou(&k.bbox, &face.bbox) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, conf: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x, y, width: w, height: h },
            confidence: conf,
            keypoints: None,
        }
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        let b = BoundingBox { x: 5.0, y: 0.0, width: 10.0, height: 10.0 };
        let c = BoundingBox { x: 20.0, y: 20.0, width: 10.0, height: 10.0 };
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &c).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlap_and_sorts() {
        let kept = nms(
            vec![
                face(200.0, 200.0, 50.0, 50.0, 0.7),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(5.0, 5.0, 100.0, 100.0, 0.8),
            ],
            0.4,
        );
        let confs: Vec<f32> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(320, 240);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (400 + i).to_string()).collect();
        assert_eq!(map_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let img = GrayImage::from_pixel(320, 240, image::Luma([255]));
        let (tensor, lb) = ScrfdDetector::preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, lb.pad_y as usize + 10, 10]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 0.01);
    }

    #[test]
    fn test_decode_single_anchor() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let stride = 32usize;
        let grid = 640 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.5f32; anchors * 10];
        // Cell (x=2, y=1), first anchor.
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let level = StrideLevel { stride, scores: &scores, boxes: &boxes, kps: &kps };
        let faces = level.decode(&lb, 0.5);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert_eq!(f.bbox, BoundingBox { x: 32.0, y: 0.0, width: 64.0, height: 64.0 });
        assert_eq!(f.keypoints.unwrap().left_eye, (80.0, 48.0));
    }
}

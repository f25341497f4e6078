//! Stub detector and embedder shared by unit tests.

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{Embedder, EmbedderError};
use crate::quality::mean_luminance;
use crate::types::{BoundingBox, DetectedFace, Embedding, Keypoints};
use image::{GrayImage, Luma};
use std::collections::VecDeque;

/// Replays one scripted detection list per `detect` call; returns no faces
/// once the script is exhausted.
pub struct ScriptedDetector {
    script: VecDeque<Vec<DetectedFace>>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<DetectedFace>>) -> Self {
        Self { script: script.into() }
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, _image: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError> {
        Ok(self.script.pop_front().unwrap_or_default())
    }
}

/// Deterministic 3-d "embedding" from crop statistics.
pub struct StatsEmbedder {
    pub declared_dim: usize,
}

impl Default for StatsEmbedder {
    fn default() -> Self {
        Self { declared_dim: 3 }
    }
}

impl Embedder for StatsEmbedder {
    fn dimension(&self) -> usize {
        self.declared_dim
    }

    fn embed(&mut self, face: &GrayImage) -> Result<Embedding, EmbedderError> {
        let mean = mean_luminance(face);
        let top_left = face.get_pixel(0, 0)[0] as f32;
        Ok(Embedding::new(vec![mean / 255.0, top_left / 255.0, 1.0]))
    }
}

/// Square face box at (x, y) with level eyes.
pub fn face_at(x: f32, y: f32, side: f32) -> DetectedFace {
    let eye_y = y + side * 0.4;
    DetectedFace {
        bbox: BoundingBox { x, y, width: side, height: side },
        confidence: 0.9,
        keypoints: Some(Keypoints {
            left_eye: (x + side * 0.3, eye_y),
            right_eye: (x + side * 0.7, eye_y),
            nose: (x + side * 0.5, y + side * 0.55),
            mouth_left: (x + side * 0.35, y + side * 0.75),
            mouth_right: (x + side * 0.65, y + side * 0.75),
        }),
    }
}

/// 200×200 frame with fine, mid-grey texture that passes the default gate.
pub fn sharp_frame() -> GrayImage {
    GrayImage::from_fn(200, 200, |x, y| {
        if ((x / 4) + (y / 4)) % 2 == 0 { Luma([70]) } else { Luma([180]) }
    })
}

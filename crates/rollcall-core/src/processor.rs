//! Per-image face pipeline: detect, select, align, quality-gate, embed.

use crate::alignment::align_face;
use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{Embedder, EmbedderError};
use crate::quality::{QualityGate, QualityIssue, QualityReport};
use crate::types::{DetectedFace, Embedding};
use image::GrayImage;
use serde::Serialize;
use thiserror::Error;

/// Why a single image contributed no embedding. Never fatal to a batch.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ImageRejection {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("expected exactly one face, found {0}")]
    AmbiguousFaceCount(usize),
    #[error("face has no eye keypoints for alignment")]
    MissingKeypoints,
    #[error("low quality face: {0}")]
    LowQualityFace(#[from] QualityIssue),
}

#[derive(Error, Debug)]
pub enum FaceError {
    #[error(transparent)]
    Rejected(#[from] ImageRejection),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("embedder returned {got}-dim vector, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// How to handle frames with several faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceSelection {
    /// More than one face rejects the image with `AmbiguousFaceCount`.
    ExactlyOne,
    /// Use the face with the largest box.
    Largest,
}

/// A face that passed alignment and the quality gate.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub face: DetectedFace,
    pub crop: GrayImage,
    pub quality: QualityReport,
}

/// Owns the detector and embedder handles for one worker.
///
/// Models are loaded once by the caller and injected here; nothing in this
/// crate holds global model state.
pub struct FaceProcessor<D, E> {
    detector: D,
    embedder: E,
    gate: QualityGate,
}

impl<D: FaceDetector, E: Embedder> FaceProcessor<D, E> {
    pub fn new(detector: D, embedder: E, gate: QualityGate) -> Self {
        Self {
            detector,
            embedder,
            gate,
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn quality_gate(&self) -> &QualityGate {
        &self.gate
    }

    /// Detect, select, align and quality-check the face in `image`.
    pub fn prepare(&mut self, image: &GrayImage, selection: FaceSelection) -> Result<AlignedFace, FaceError> {
        let faces = self.detector.detect(image)?;
        let face = select_face(faces, selection)?;
        let crop = align_face(image, &face, self.embedder.input_size()).ok_or(ImageRejection::MissingKeypoints)?;
        let quality = self.gate.check(&face.bbox, &crop).map_err(ImageRejection::from)?;
        Ok(AlignedFace { face, crop, quality })
    }

    /// Embed an aligned crop, checking the model's declared dimensionality.
    pub fn embed(&mut self, crop: &GrayImage) -> Result<Embedding, FaceError> {
        let embedding = self.embedder.embed(crop)?;
        let expected = self.embedder.dimension();
        if embedding.dimension() != expected {
            return Err(FaceError::DimensionMismatch {
                expected,
                got: embedding.dimension(),
            });
        }
        Ok(embedding)
    }

    /// Probe embedding for a live capture. The frame must show exactly one face.
    pub fn probe(&mut self, image: &GrayImage) -> Result<Embedding, FaceError> {
        let aligned = self.prepare(image, FaceSelection::ExactlyOne)?;
        tracing::debug!(
            confidence = aligned.face.confidence,
            sharpness = aligned.quality.sharpness,
            luminance = aligned.quality.luminance,
            "probe face accepted"
        );
        self.embed(&aligned.crop)
    }
}

fn select_face(mut faces: Vec<DetectedFace>, selection: FaceSelection) -> Result<DetectedFace, ImageRejection> {
    match (faces.len(), selection) {
        (0, _) => Err(ImageRejection::NoFaceDetected),
        (1, _) => Ok(faces.remove(0)),
        (n, FaceSelection::ExactlyOne) => Err(ImageRejection::AmbiguousFaceCount(n)),
        (_, FaceSelection::Largest) => {
            let idx = faces
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.bbox.area().total_cmp(&b.bbox.area()))
                .map(|(i, _)| i)
                .unwrap_or(0);
            Ok(faces.swap_remove(idx))
        }
    }
}

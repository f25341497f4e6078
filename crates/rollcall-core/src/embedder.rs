//! Embedding seam and the ArcFace implementation.
//!
//! ArcFace (w600k_r50) maps a 112×112 aligned face to a 512-dimensional
//! L2-normalized vector.

use crate::alignment::ALIGNED_SIZE;
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an aligned face crop to an identity embedding.
///
/// Calls may be slow; callers on async runtimes should run them off the
/// reactor and bound them with a timeout.
pub trait Embedder {
    /// Dimensionality of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Side length of the square crop the model expects.
    fn input_size(&self) -> u32 {
        ALIGNED_SIZE
    }

    fn embed(&mut self, face: &GrayImage) -> Result<Embedding, EmbedderError>;
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Convert a crop into a normalized 1×3×112×112 tensor, resizing first if
    /// the crop is not already model-sized.
    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let size = ALIGNED_SIZE;
        let resized;
        let face = if face.dimensions() == (size, size) {
            face
        } else {
            resized = imageops::resize(face, size, size, FilterType::Triangle);
            &resized
        };

        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in face.enumerate_pixels() {
            let v = (pixel[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = v;
            }
        }
        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn embed(&mut self, face: &GrayImage) -> Result<Embedding, EmbedderError> {
        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let mut embedding = Embedding {
            values: raw.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        };
        embedding.normalize();
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_preprocess_shape_and_channels() {
        let crop = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Luma([100]));
        let tensor = ArcFaceEmbedder::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (100.0 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            assert!((tensor[[0, c, 5, 7]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_preprocess_resizes_odd_crop() {
        let crop = GrayImage::from_pixel(160, 160, Luma([255]));
        let tensor = ArcFaceEmbedder::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 50, 50]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceEmbedder::load("/nonexistent/w600k_r50.onnx", 1).err().unwrap();
        assert!(matches!(err, EmbedderError::ModelNotFound(_)));
    }
}

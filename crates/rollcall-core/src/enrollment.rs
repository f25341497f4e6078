//! Enrollment: photos in, validated embedding set out.
//!
//! Each photo is detected, aligned and quality-gated independently. Photos
//! that fail are skipped with a warning; the batch only fails when nothing
//! usable is left. Accepted crops can be multiplied with random
//! brightness/contrast/rotation variants to widen pose and lighting coverage.

use crate::augment::{AugmentConfig, Augmenter};
use crate::detector::FaceDetector;
use crate::embedder::Embedder;
use crate::processor::{FaceError, FaceProcessor, FaceSelection, ImageRejection};
use crate::types::Embedding;
use image::GrayImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no usable faces in {attempted} image(s)")]
    NoUsableFaces {
        attempted: usize,
        rejected: Vec<RejectedImage>,
    },
    #[error(transparent)]
    Face(#[from] FaceError),
}

/// Enrollment tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrollmentPolicy {
    /// Reject photos showing more than one face instead of using the largest.
    pub require_single_face: bool,
    /// Augmented variants embedded per accepted photo.
    pub augmentations: usize,
    pub augment: AugmentConfig,
    /// Fixed seed for the augmentation stream; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self {
            require_single_face: true,
            augmentations: 4,
            augment: AugmentConfig::default(),
            seed: None,
        }
    }
}

/// A photo that contributed nothing, with its position in the batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedImage {
    pub index: usize,
    pub reason: ImageRejection,
}

/// Embeddings produced for one identity.
///
/// Order is source-photo order; within a photo the original crop comes
/// before its augmented variants.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub identity_id: String,
    pub embeddings: Vec<Embedding>,
    /// Batch indices of photos that produced embeddings.
    pub accepted: Vec<usize>,
    pub rejected: Vec<RejectedImage>,
}

/// Turns enrollment photos into embeddings using an injected processor.
pub struct EnrollmentPipeline<D, E> {
    processor: FaceProcessor<D, E>,
    policy: EnrollmentPolicy,
}

impl<D: FaceDetector, E: Embedder> EnrollmentPipeline<D, E> {
    pub fn new(processor: FaceProcessor<D, E>, policy: EnrollmentPolicy) -> Self {
        Self { processor, policy }
    }

    pub fn policy(&self) -> &EnrollmentPolicy {
        &self.policy
    }

    /// The shared processor, also used for live probes.
    pub fn processor(&mut self) -> &mut FaceProcessor<D, E> {
        &mut self.processor
    }

    /// Enroll `images` for `identity_id`.
    ///
    /// Model failures abort the whole batch; nothing is returned partially.
    pub fn enroll(&mut self, identity_id: &str, images: &[GrayImage]) -> Result<Enrollment, EnrollError> {
        let selection = if self.policy.require_single_face {
            FaceSelection::ExactlyOne
        } else {
            FaceSelection::Largest
        };
        let mut augmenter = match self.policy.seed {
            Some(seed) => Augmenter::seeded(self.policy.augment, seed),
            None => Augmenter::new(self.policy.augment),
        };

        let mut embeddings = Vec::new();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for (index, image) in images.iter().enumerate() {
            let aligned = match self.processor.prepare(image, selection) {
                Ok(aligned) => aligned,
                Err(FaceError::Rejected(reason)) => {
                    tracing::warn!(identity = identity_id, index, %reason, "enrollment image skipped");
                    rejected.push(RejectedImage { index, reason });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            embeddings.push(self.processor.embed(&aligned.crop)?);
            for _ in 0..self.policy.augmentations {
                let variant = augmenter.variant(&aligned.crop);
                embeddings.push(self.processor.embed(&variant)?);
            }
            accepted.push(index);
        }

        if embeddings.is_empty() {
            return Err(EnrollError::NoUsableFaces {
                attempted: images.len(),
                rejected,
            });
        }

        tracing::info!(
            identity = identity_id,
            photos = images.len(),
            accepted = accepted.len(),
            embeddings = embeddings.len(),
            "enrollment embeddings computed"
        );

        Ok(Enrollment {
            identity_id: identity_id.to_string(),
            embeddings,
            accepted,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{QualityGate, QualityIssue};
    use crate::testing::{face_at, sharp_frame, ScriptedDetector, StatsEmbedder};
    use image::Luma;

    fn pipeline(script: Vec<Vec<crate::types::DetectedFace>>, augmentations: usize) -> EnrollmentPipeline<ScriptedDetector, StatsEmbedder> {
        let processor = FaceProcessor::new(ScriptedDetector::new(script), StatsEmbedder::default(), QualityGate::default());
        EnrollmentPipeline::new(
            processor,
            EnrollmentPolicy {
                augmentations,
                seed: Some(11),
                ..EnrollmentPolicy::default()
            },
        )
    }

    fn blurry_frame() -> GrayImage {
        GrayImage::from_pixel(200, 200, Luma([128]))
    }

    #[test]
    fn test_mixed_batch_keeps_valid_image() {
        // no face, blurry face, valid face
        let script = vec![vec![], vec![face_at(50.0, 50.0, 100.0)], vec![face_at(50.0, 50.0, 100.0)]];
        let images = vec![sharp_frame(), blurry_frame(), sharp_frame()];

        let result = pipeline(script, 2).enroll("S1", &images).unwrap();

        assert_eq!(result.accepted, vec![2]);
        assert_eq!(result.embeddings.len(), 3);
        assert_eq!(result.rejected.len(), 2);
        assert_eq!(result.rejected[0], RejectedImage { index: 0, reason: ImageRejection::NoFaceDetected });
        assert!(matches!(
            result.rejected[1].reason,
            ImageRejection::LowQualityFace(QualityIssue::Blurry { .. })
        ));
    }

    #[test]
    fn test_original_embedding_comes_first() {
        let script = vec![vec![face_at(50.0, 50.0, 100.0)]];
        let images = vec![sharp_frame()];
        let result = pipeline(script, 3).enroll("S1", &images).unwrap();

        let mut reference = pipeline(vec![vec![face_at(50.0, 50.0, 100.0)]], 0);
        let plain = reference.enroll("S1", &images).unwrap();

        assert_eq!(result.embeddings.len(), 4);
        assert_eq!(result.embeddings[0], plain.embeddings[0]);
    }

    #[test]
    fn test_nothing_usable_fails_batch() {
        let script = vec![vec![], vec![face_at(50.0, 50.0, 100.0)]];
        let err = pipeline(script, 2)
            .enroll("S1", &[sharp_frame(), blurry_frame()])
            .unwrap_err();
        match err {
            EnrollError::NoUsableFaces { attempted, rejected } => {
                assert_eq!(attempted, 2);
                assert_eq!(rejected.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_batch_fails() {
        let err = pipeline(vec![], 0).enroll("S1", &[]).unwrap_err();
        assert!(matches!(err, EnrollError::NoUsableFaces { attempted: 0, .. }));
    }

    #[test]
    fn test_strict_policy_rejects_group_photo() {
        let crowd = vec![face_at(10.0, 10.0, 80.0), face_at(100.0, 100.0, 90.0)];
        let script = vec![crowd.clone(), vec![face_at(50.0, 50.0, 100.0)]];
        let result = pipeline(script, 0).enroll("S1", &[sharp_frame(), sharp_frame()]).unwrap();
        assert_eq!(result.accepted, vec![1]);
        assert_eq!(result.rejected[0].reason, ImageRejection::AmbiguousFaceCount(2));

        let mut lenient = pipeline(vec![crowd], 0);
        lenient.policy.require_single_face = false;
        let result = lenient.enroll("S1", &[sharp_frame()]).unwrap();
        assert_eq!(result.accepted, vec![0]);
    }

    #[test]
    fn test_accepted_count_is_stable_across_runs() {
        let script = || vec![vec![], vec![face_at(50.0, 50.0, 100.0)], vec![face_at(50.0, 50.0, 100.0)]];
        let images = vec![sharp_frame(), blurry_frame(), sharp_frame()];
        let mut first = pipeline(script(), 3);
        first.policy.seed = None;
        let mut second = pipeline(script(), 3);
        second.policy.seed = None;

        let a = first.enroll("S1", &images).unwrap();
        let b = second.enroll("S1", &images).unwrap();
        assert_eq!(a.embeddings.len(), b.embeddings.len());
        assert_eq!(a.accepted, b.accepted);
    }
}

//! rollcall-core: Identity matching engine.
//!
//! Turns enrollment photos into validated embedding sets and matches live
//! probes against the enrolled gallery. Face detection and embedding run
//! behind the [`FaceDetector`] and [`Embedder`] seams; SCRFD and ArcFace
//! implementations via ONNX Runtime are provided.

pub mod alignment;
pub mod augment;
pub mod detector;
pub mod embedder;
pub mod enrollment;
pub mod matcher;
pub mod processor;
pub mod quality;
pub mod types;

#[cfg(test)]
mod testing;

pub use augment::AugmentConfig;
pub use detector::{DetectorError, FaceDetector, ScrfdDetector, ScrfdOptions};
pub use embedder::{ArcFaceEmbedder, Embedder, EmbedderError};
pub use enrollment::{EnrollError, Enrollment, EnrollmentPipeline, EnrollmentPolicy, RejectedImage};
pub use matcher::{cosine_distance, FaceMatcher, MatchError, MatchOutcome};
pub use processor::{AlignedFace, FaceError, FaceProcessor, FaceSelection, ImageRejection};
pub use quality::{QualityGate, QualityIssue, QualityReport};
pub use types::{BoundingBox, DetectedFace, Embedding, Gallery, GalleryEntry, Identity, IdentityStatus, Keypoints};

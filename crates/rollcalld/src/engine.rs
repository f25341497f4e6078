use image::GrayImage;
use rollcall_core::{
    ArcFaceEmbedder, DetectorError, Embedder, EmbedderError, Embedding, EnrollError, Enrollment, EnrollmentPipeline,
    FaceDetector, FaceError, FaceProcessor, ScrfdDetector,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("image {index} could not be decoded: {source}")]
    Decode {
        index: usize,
        #[source]
        source: image::ImageError,
    },
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        identity_id: String,
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Enrollment, EngineError>>,
    },
    Probe {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Compute the enrollment embedding set for encoded photos.
    pub async fn enroll(&self, identity_id: &str, images: Vec<Vec<u8>>) -> Result<Enrollment, EngineError> {
        let identity_id = identity_id.to_string();
        self.call(|reply| EngineRequest::Enroll {
            identity_id,
            images,
            reply,
        })
        .await
    }

    /// Embed the single face in an encoded live capture.
    pub async fn probe(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        self.call(|reply| EngineRequest::Probe { image, reply }).await
    }

    /// Send a request and wait for the reply, both bounded by one engine
    /// timeout. A full queue counts against the same deadline.
    ///
    /// A timed-out request that was already queued still runs to completion
    /// on the engine thread; its reply is dropped, so callers never see a
    /// partial result.
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = build(reply_tx);
        let exchange = async {
            self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }
}

/// Load both ONNX models and start the engine thread. Fails fast if either
/// model is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path, config.scrfd_options())?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let embedder_path = config.embedder_model_path();
    let embedder = ArcFaceEmbedder::load(&embedder_path, config.model_threads)?;
    tracing::info!(path = %embedder_path, "ArcFace embedder loaded");

    let processor = FaceProcessor::new(detector, embedder, config.quality_gate());
    let pipeline = EnrollmentPipeline::new(processor, config.enrollment_policy());
    Ok(spawn_with(pipeline, Duration::from_secs(config.engine_timeout_secs)))
}

/// Run `pipeline` on a dedicated OS thread that owns the model handles.
pub fn spawn_with<D, E>(mut pipeline: EnrollmentPipeline<D, E>, timeout: Duration) -> EngineHandle
where
    D: FaceDetector + Send + 'static,
    E: Embedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        identity_id,
                        images,
                        reply,
                    } => {
                        let result = run_enroll(&mut pipeline, &identity_id, &images);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Probe { image, reply } => {
                        let result = decode(0, &image)
                            .and_then(|frame| pipeline.processor().probe(&frame).map_err(EngineError::from));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx, timeout }
}

fn decode(index: usize, bytes: &[u8]) -> Result<GrayImage, EngineError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_luma8())
        .map_err(|source| EngineError::Decode { index, source })
}

fn run_enroll<D: FaceDetector, E: Embedder>(
    pipeline: &mut EnrollmentPipeline<D, E>,
    identity_id: &str,
    images: &[Vec<u8>],
) -> Result<Enrollment, EngineError> {
    let frames = images
        .iter()
        .enumerate()
        .map(|(index, bytes)| decode(index, bytes))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(identity = identity_id, photos = frames.len(), "enroll: decoded photos");
    Ok(pipeline.enroll(identity_id, &frames)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Luma};
    use rollcall_core::{BoundingBox, DetectedFace, EnrollmentPolicy, ImageRejection, Keypoints, QualityGate};
    use std::io::Cursor;

    /// Reports one centred face with level eyes in every frame.
    pub struct CentredFace;

    impl FaceDetector for CentredFace {
        fn detect(&mut self, image: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError> {
            let (w, h) = (image.width() as f32, image.height() as f32);
            if w < 8.0 {
                return Ok(vec![]);
            }
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: w,
                    height: h,
                },
                confidence: 0.9,
                keypoints: Some(Keypoints {
                    left_eye: (w * 0.3, h * 0.4),
                    right_eye: (w * 0.7, h * 0.4),
                    nose: (w * 0.5, h * 0.55),
                    mouth_left: (w * 0.35, h * 0.75),
                    mouth_right: (w * 0.65, h * 0.75),
                }),
            }])
        }
    }

    /// Embeds a crop as (brightness, 1 - brightness).
    pub struct BrightnessEmbedder {
        pub delay: Duration,
    }

    impl Embedder for BrightnessEmbedder {
        fn dimension(&self) -> usize {
            2
        }

        fn embed(&mut self, face: &GrayImage) -> Result<Embedding, EmbedderError> {
            std::thread::sleep(self.delay);
            let mean = face.pixels().map(|p| p[0] as f32).sum::<f32>() / (face.len() as f32).max(1.0) / 255.0;
            Ok(Embedding::new(vec![mean, 1.0 - mean]))
        }
    }

    pub fn open_gate() -> QualityGate {
        QualityGate {
            min_face_px: 0.0,
            blur_floor: 0.0,
            min_luminance: 0.0,
            max_luminance: 255.0,
        }
    }

    pub fn stub_engine(delay: Duration, timeout: Duration) -> EngineHandle {
        let processor = FaceProcessor::new(CentredFace, BrightnessEmbedder { delay }, open_gate());
        let policy = EnrollmentPolicy {
            augmentations: 1,
            seed: Some(3),
            ..EnrollmentPolicy::default()
        };
        spawn_with(EnrollmentPipeline::new(processor, policy), timeout)
    }

    pub fn png(side: u32, value: u8) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        GrayImage::from_pixel(side, side, Luma([value]))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_probe_round_trip() {
        let engine = stub_engine(Duration::ZERO, Duration::from_secs(5));
        let embedding = engine.probe(png(120, 51)).await.unwrap();
        assert_eq!(embedding.dimension(), 2);
        assert!((embedding.values[0] - 0.2).abs() < 0.02);
    }

    #[tokio::test]
    async fn test_probe_without_face_is_rejected() {
        let engine = stub_engine(Duration::ZERO, Duration::from_secs(5));
        let err = engine.probe(png(4, 128)).await.unwrap_err();
        assert!(matches!(err, EngineError::Face(FaceError::Rejected(ImageRejection::NoFaceDetected))));
    }

    #[tokio::test]
    async fn test_enroll_counts_augmentations() {
        let engine = stub_engine(Duration::ZERO, Duration::from_secs(5));
        let enrollment = engine.enroll("S1", vec![png(120, 100), png(4, 100), png(120, 180)]).await.unwrap();
        assert_eq!(enrollment.accepted, vec![0, 2]);
        assert_eq!(enrollment.embeddings.len(), 4);
        assert_eq!(enrollment.rejected[0].index, 1);
    }

    #[tokio::test]
    async fn test_undecodable_photo_fails_batch() {
        let engine = stub_engine(Duration::ZERO, Duration::from_secs(5));
        let err = engine
            .enroll("S1", vec![png(120, 100), b"not an image".to_vec()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Decode { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_full_queue_counts_against_timeout() {
        let engine = stub_engine(Duration::from_millis(400), Duration::from_millis(50));
        let frame = png(120, 100);

        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let frame = frame.clone();
            calls.spawn(async move {
                let started = std::time::Instant::now();
                let result = engine.probe(frame).await;
                (result, started.elapsed())
            });
        }

        while let Some(joined) = calls.join_next().await {
            let (result, elapsed) = joined.unwrap();
            assert!(matches!(result, Err(EngineError::Timeout(_))));
            assert!(elapsed < Duration::from_millis(300), "call waited {elapsed:?}");
        }
    }

    #[tokio::test]
    async fn test_slow_engine_times_out() {
        let engine = stub_engine(Duration::from_millis(300), Duration::from_millis(20));
        let err = engine.probe(png(120, 100)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}

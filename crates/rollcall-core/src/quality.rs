//! Quality gate for aligned face crops: size, blur and exposure.

use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a face crop was rejected.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QualityIssue {
    #[error("face too small: {side:.0}px < {min:.0}px")]
    TooSmall { side: f32, min: f32 },
    #[error("face too blurry: laplacian variance {score:.1} < {floor:.1}")]
    Blurry { score: f64, floor: f64 },
    #[error("face underexposed: mean luminance {mean:.1} < {min:.1}")]
    Underexposed { mean: f32, min: f32 },
    #[error("face overexposed: mean luminance {mean:.1} > {max:.1}")]
    Overexposed { mean: f32, max: f32 },
}

/// Measurements taken for an accepted crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub face_side: f32,
    pub sharpness: f64,
    pub luminance: f32,
}

/// Acceptance bounds for a face crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    /// Minimum length of the shorter side of the detected box, in source pixels.
    pub min_face_px: f32,
    /// Minimum variance of the Laplacian over the aligned crop.
    pub blur_floor: f64,
    pub min_luminance: f32,
    pub max_luminance: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_face_px: 50.0,
            blur_floor: 100.0,
            min_luminance: 50.0,
            max_luminance: 200.0,
        }
    }
}

impl QualityGate {
    /// Check a detection box and its aligned crop. Size is judged on the
    /// source box, since the crop is always resized to the model input.
    pub fn check(&self, bbox: &BoundingBox, aligned: &GrayImage) -> Result<QualityReport, QualityIssue> {
        let side = bbox.min_side();
        if side < self.min_face_px {
            return Err(QualityIssue::TooSmall {
                side,
                min: self.min_face_px,
            });
        }

        let sharpness = laplacian_variance(aligned);
        if sharpness < self.blur_floor {
            return Err(QualityIssue::Blurry {
                score: sharpness,
                floor: self.blur_floor,
            });
        }

        let luminance = mean_luminance(aligned);
        if luminance < self.min_luminance {
            return Err(QualityIssue::Underexposed {
                mean: luminance,
                min: self.min_luminance,
            });
        }
        if luminance > self.max_luminance {
            return Err(QualityIssue::Overexposed {
                mean: luminance,
                max: self.max_luminance,
            });
        }

        Ok(QualityReport {
            face_side: side,
            sharpness,
            luminance,
        })
    }
}

/// Average pixel brightness (0.0–255.0).
pub fn mean_luminance(image: &GrayImage) -> f32 {
    let data = image.as_raw();
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
}

/// Variance of the 4-neighbour Laplacian over the image interior.
///
/// Sharp edges give large responses; defocus and motion blur flatten them.
/// Images smaller than 3×3 score 0.
pub fn laplacian_variance(image: &GrayImage) -> f64 {
    let (w, h) = image.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| image.get_pixel(x, y)[0] as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0u64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checkerboard(size: u32, cell: u32, lo: u8, hi: u8) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 { Luma([lo]) } else { Luma([hi]) }
        })
    }

    fn bbox(side: f32) -> BoundingBox {
        BoundingBox { x: 0.0, y: 0.0, width: side, height: side }
    }

    #[test]
    fn test_laplacian_flat_image_is_zero() {
        let img = GrayImage::from_pixel(32, 32, Luma([120]));
        assert_eq!(laplacian_variance(&img), 0.0);
    }

    #[test]
    fn test_laplacian_sharp_beats_smooth() {
        let sharp = checkerboard(32, 2, 60, 190);
        let smooth = GrayImage::from_fn(32, 32, |x, _| Luma([(100 + x) as u8]));
        assert!(laplacian_variance(&sharp) > 1000.0);
        assert!(laplacian_variance(&smooth) < 1.0);
    }

    #[test]
    fn test_laplacian_tiny_image() {
        assert_eq!(laplacian_variance(&GrayImage::new(2, 2)), 0.0);
    }

    #[test]
    fn test_mean_luminance() {
        let img = checkerboard(10, 1, 100, 200);
        assert!((mean_luminance(&img) - 150.0).abs() < 1e-3);
        assert_eq!(mean_luminance(&GrayImage::new(0, 0)), 0.0);
    }

    #[test]
    fn test_gate_accepts_good_crop() {
        let report = QualityGate::default()
            .check(&bbox(120.0), &checkerboard(112, 4, 70, 180))
            .unwrap();
        assert!(report.sharpness > 100.0);
        assert!((report.luminance - 125.0).abs() < 1.0);
    }

    #[test]
    fn test_gate_rejects_small_face() {
        let err = QualityGate::default()
            .check(&bbox(30.0), &checkerboard(112, 4, 70, 180))
            .unwrap_err();
        assert!(matches!(err, QualityIssue::TooSmall { .. }));
    }

    #[test]
    fn test_gate_rejects_blur() {
        let blurry = GrayImage::from_pixel(112, 112, Luma([128]));
        let err = QualityGate::default().check(&bbox(120.0), &blurry).unwrap_err();
        assert!(matches!(err, QualityIssue::Blurry { .. }));
    }

    #[test]
    fn test_gate_rejects_exposure() {
        let gate = QualityGate::default();
        let dark = checkerboard(112, 2, 0, 60);
        let bright = checkerboard(112, 2, 195, 255);
        assert!(matches!(gate.check(&bbox(120.0), &dark), Err(QualityIssue::Underexposed { .. })));
        assert!(matches!(gate.check(&bbox(120.0), &bright), Err(QualityIssue::Overexposed { .. })));
    }
}

//! Photometric and geometric jitter for enrollment crops.

use crate::alignment::rotate_about;
use crate::quality::mean_luminance;
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Ranges for the random variants synthesized from each accepted crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Multiplicative gain range.
    pub brightness: (f32, f32),
    /// Contrast scale about the crop mean.
    pub contrast: (f32, f32),
    /// Maximum absolute in-plane rotation, degrees.
    pub max_rotation_deg: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            brightness: (0.8, 1.2),
            contrast: (0.8, 1.2),
            max_rotation_deg: 15.0,
        }
    }
}

/// Draws jittered variants of aligned crops.
pub struct Augmenter {
    config: AugmentConfig,
    rng: StdRng,
}

impl Augmenter {
    pub fn new(config: AugmentConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible variant stream, for tests and audits.
    pub fn seeded(config: AugmentConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One random brightness/contrast/rotation variant of `crop`.
    pub fn variant(&mut self, crop: &GrayImage) -> GrayImage {
        let gain = sample(&mut self.rng, self.config.brightness);
        let contrast = sample(&mut self.rng, self.config.contrast);
        let max = self.config.max_rotation_deg.abs();
        let degrees = sample(&mut self.rng, (-max, max));

        let adjusted = adjust(crop, gain, contrast);
        let center = (crop.width() as f32 / 2.0, crop.height() as f32 / 2.0);
        rotate_about(&adjusted, center, degrees.to_radians())
    }
}

fn sample(rng: &mut StdRng, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo { rng.gen_range(lo..hi) } else { lo }
}

/// Scale brightness by `gain`, then stretch contrast by `contrast` about the
/// new mean. Saturates at 0 and 255.
pub fn adjust(image: &GrayImage, gain: f32, contrast: f32) -> GrayImage {
    let brightened = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y)[0] as f32 * gain;
        Luma([p.round().clamp(0.0, 255.0) as u8])
    });
    let mean = mean_luminance(&brightened);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = brightened.get_pixel(x, y)[0] as f32;
        Luma([((p - mean) * contrast + mean).round().clamp(0.0, 255.0) as u8])
    })
}

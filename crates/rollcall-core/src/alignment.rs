//! Face alignment by eye-line rotation.
//!
//! The full image is rotated about the face centre so that the eye-to-eye
//! vector becomes horizontal, then the face box is cropped and resized to the
//! embedding model's fixed input size. Rotation, crop and resize are fused
//! into a single inverse mapping with bilinear sampling.

use crate::types::{DetectedFace, Keypoints};
use image::{GrayImage, Luma};

/// ArcFace input size.
pub const ALIGNED_SIZE: u32 = 112;

/// In-plane angle of the eye line in radians (positive = clockwise in image
/// coordinates, where y grows downward).
pub fn eye_angle(keypoints: &Keypoints) -> f32 {
    let (lx, ly) = keypoints.left_eye;
    let (rx, ry) = keypoints.right_eye;
    (ry - ly).atan2(rx - lx)
}

/// Sample `image` at a sub-pixel position. Out-of-bounds samples are black.
fn sample_bilinear(image: &GrayImage, sx: f32, sy: f32) -> f32 {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i32, y: i32| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.get_pixel(x as u32, y as u32)[0] as f32
        } else {
            0.0
        }
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Build an `out_w × out_h` image whose pixel (x, y) is sampled from the
/// source position returned by `to_source`.
fn warp<F>(image: &GrayImage, out_w: u32, out_h: u32, to_source: F) -> GrayImage
where
    F: Fn(f32, f32) -> (f32, f32),
{
    GrayImage::from_fn(out_w, out_h, |x, y| {
        let (sx, sy) = to_source(x as f32, y as f32);
        Luma([sample_bilinear(image, sx, sy).round().clamp(0.0, 255.0) as u8])
    })
}

/// Rotate `image` by `angle` radians about `center`, keeping its size.
///
/// Pixel `p` of the output is taken from `center + R(angle) * (p - center)`
/// in the source, so content tilted by `angle` comes out level.
pub fn rotate_about(image: &GrayImage, center: (f32, f32), angle: f32) -> GrayImage {
    let (sin, cos) = angle.sin_cos();
    let (cx, cy) = center;
    warp(image, image.width(), image.height(), |x, y| {
        let (dx, dy) = (x - cx, y - cy);
        (cx + cos * dx - sin * dy, cy + sin * dx + cos * dy)
    })
}

/// Align a detected face to a canonical `out_size × out_size` crop.
///
/// Returns `None` when the detection carries no keypoints.
pub fn align_face(image: &GrayImage, face: &DetectedFace, out_size: u32) -> Option<GrayImage> {
    let keypoints = face.keypoints.as_ref()?;
    let angle = eye_angle(keypoints);
    let (sin, cos) = angle.sin_cos();
    let (cx, cy) = face.bbox.center();

    let scale_x = face.bbox.width / out_size as f32;
    let scale_y = face.bbox.height / out_size as f32;

    Some(warp(image, out_size, out_size, |ox, oy| {
        // Output pixel -> position in the levelled image (pixel-centre aligned).
        let rx = face.bbox.x + (ox + 0.5) * scale_x - 0.5;
        let ry = face.bbox.y + (oy + 0.5) * scale_y - 0.5;
        // Levelled image -> source image.
        let (dx, dy) = (rx - cx, ry - cy);
        (cx + cos * dx - sin * dy, cy + sin * dx + cos * dy)
    }))
}

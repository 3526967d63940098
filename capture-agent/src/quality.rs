//! Frame quality gate.
//!
//! Sobel gradient magnitude, averaged over the interior and normalized
//! to [0, 1]. Cheap enough to run on every frame before JPEG encode.

use image::GrayImage;

/// Sharpness score in [0, 1]. Degenerate images (under 3x3) score 0.
pub fn sobel_sharpness(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| f64::from(gray.get_pixel(x, y).0[0]);
    let mut sum = 0.0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
            sum += (gx * gx + gy * gy).sqrt();
        }
    }
    let mean = sum / f64::from((w - 2) * (h - 2));
    (mean / 255.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_image_scores_zero() {
        let flat = GrayImage::from_pixel(64, 64, image::Luma([128]));
        assert_eq!(sobel_sharpness(&flat), 0.0);
    }

    #[test]
    fn checkerboard_scores_high() {
        let sharp = GrayImage::from_fn(64, 64, |x, y| {
            image::Luma([if (x + y) % 2 == 0 { 0 } else { 255 }])
        });
        assert!(sobel_sharpness(&sharp) > 0.5);
    }

    #[test]
    fn gradient_beats_smooth_ramp() {
        let ramp = GrayImage::from_fn(64, 64, |x, _| image::Luma([(x * 4) as u8]));
        let edges = GrayImage::from_fn(64, 64, |x, _| {
            image::Luma([if (x / 8) % 2 == 0 { 20 } else { 230 }])
        });
        assert!(sobel_sharpness(&edges) > sobel_sharpness(&ramp));
    }

    #[test]
    fn tiny_image_scores_zero() {
        let tiny = GrayImage::from_pixel(2, 2, image::Luma([255]));
        assert_eq!(sobel_sharpness(&tiny), 0.0);
    }
}

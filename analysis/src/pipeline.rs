//! Analysis pipeline seam.
//!
//! The engine only ever talks to [`AnalysisPipeline`]; the algorithm
//! behind it is replaceable. The built-in encoder backend does a cheap
//! polar normalization and sign-of-difference encoding, enough to make
//! the whole system run end to end and to give identical images identical
//! codes. Pipeline outcome is data, never a panic.

use image::{DynamicImage, GrayImage};
use thiserror::Error;

use crate::code::{CodeArray, TemplateCodes};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline initialization failed: {0}")]
    Init(String),

    #[error("segmentation could not locate iris: {0}")]
    Segmentation(String),

    #[error("occlusion too high: {0:.2} of the iris is unusable")]
    Occlusion(f64),

    #[error("pipeline internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Produce intermediate images for `/analyze/detailed`.
    pub detailed: bool,
}

/// Intermediate images, PNG-encoded.
#[derive(Debug, Clone)]
pub struct PipelineImages {
    pub segmented_png: Vec<u8>,
    pub normalized_png: Vec<u8>,
}

/// What the pipeline hands back for one eye image.
#[derive(Debug, Clone)]
pub struct ProbeTemplate {
    pub codes: TemplateCodes,
    pub width: u32,
    pub height: u32,
    pub n_scales: u32,
    pub quality_score: f64,
    pub occlusion: f64,
    pub intermediates: Option<PipelineImages>,
}

/// The narrow interface the engine depends on. A single instance is not
/// thread-safe; the pool serializes access.
pub trait AnalysisPipeline: Send {
    fn name(&self) -> &'static str;

    fn analyze(
        &mut self,
        gray: &GrayImage,
        opts: &AnalyzeOptions,
    ) -> Result<ProbeTemplate, PipelineError>;
}

// ============================================================================
// Built-in encoder backend
// ============================================================================

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub code_width: u32,
    pub code_height: u32,
    pub n_scales: u32,
    /// Minimum pixel standard deviation for a plausible eye image.
    pub min_contrast: f64,
    /// Reject when more than this fraction of samples is unusable.
    pub max_occlusion: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            code_width: 128,
            code_height: 8,
            n_scales: 2,
            min_contrast: 6.0,
            max_occlusion: 0.6,
        }
    }
}

pub struct EncoderPipeline {
    cfg: EncoderConfig,
}

impl EncoderPipeline {
    pub fn new(cfg: EncoderConfig) -> Self {
        Self { cfg }
    }

    /// Polar resampling of the annulus between pupil and iris radius.
    /// Returns (samples, validity) as row-major code_height x code_width.
    fn normalize(&self, gray: &GrayImage) -> (Vec<f64>, Vec<bool>) {
        let (img_w, img_h) = gray.dimensions();
        let cx = f64::from(img_w) / 2.0;
        let cy = f64::from(img_h) / 2.0;
        let iris_r = f64::from(img_w.min(img_h)) * 0.35;
        let pupil_r = iris_r * 0.35;

        let rows = self.cfg.code_height as usize;
        let cols = self.cfg.code_width as usize;
        let mut samples = vec![0.0f64; rows * cols];
        let mut valid = vec![false; rows * cols];

        for row in 0..rows {
            let radius = pupil_r
                + (iris_r - pupil_r) * (row as f64 + 0.5) / rows as f64;
            for col in 0..cols {
                let theta = std::f64::consts::TAU * col as f64 / cols as f64;
                let x = cx + radius * theta.cos();
                let y = cy + radius * theta.sin();
                let idx = row * cols + col;
                if x < 0.0 || y < 0.0 || x >= f64::from(img_w) || y >= f64::from(img_h) {
                    continue;
                }
                let pixel = gray.get_pixel(x as u32, y as u32).0[0];
                samples[idx] = f64::from(pixel);
                // Saturated pixels are specular highlights or eyelid skin.
                valid[idx] = pixel > 5 && pixel < 250;
            }
        }
        (samples, valid)
    }

    fn png_of(&self, samples: &[f64]) -> Result<Vec<u8>, PipelineError> {
        let rows = self.cfg.code_height;
        let cols = self.cfg.code_width;
        let mut img = GrayImage::new(cols, rows);
        for row in 0..rows {
            for col in 0..cols {
                let v = samples[(row * cols + col) as usize].clamp(0.0, 255.0) as u8;
                img.put_pixel(col, row, image::Luma([v]));
            }
        }
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .map_err(|e| PipelineError::Internal(format!("png encode: {e}")))?;
        Ok(out.into_inner())
    }
}

impl AnalysisPipeline for EncoderPipeline {
    fn name(&self) -> &'static str {
        "encoder"
    }

    fn analyze(
        &mut self,
        gray: &GrayImage,
        opts: &AnalyzeOptions,
    ) -> Result<ProbeTemplate, PipelineError> {
        let (img_w, img_h) = gray.dimensions();
        if img_w.min(img_h) < 32 {
            return Err(PipelineError::Segmentation(format!(
                "image {img_w}x{img_h} too small"
            )));
        }

        // A flat image has no iris texture to segment.
        let n = (img_w as f64) * (img_h as f64);
        let mean: f64 = gray.pixels().map(|p| f64::from(p.0[0])).sum::<f64>() / n;
        let var: f64 = gray
            .pixels()
            .map(|p| {
                let d = f64::from(p.0[0]) - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        if var.sqrt() < self.cfg.min_contrast {
            return Err(PipelineError::Segmentation("no iris texture".to_string()));
        }

        let (samples, valid) = self.normalize(gray);
        let cols = self.cfg.code_width as usize;
        let invalid = valid.iter().filter(|v| !**v).count();
        let occlusion = invalid as f64 / valid.len() as f64;
        if occlusion > self.cfg.max_occlusion {
            return Err(PipelineError::Occlusion(occlusion));
        }

        // Sign-of-difference encoding at doubling angular offsets.
        let mut scales = Vec::with_capacity(self.cfg.n_scales as usize);
        let mut masks = Vec::with_capacity(self.cfg.n_scales as usize);
        for s in 0..self.cfg.n_scales {
            let offset = 1usize << s;
            let mut code = CodeArray::new(self.cfg.code_width, self.cfg.code_height);
            let mut mask = CodeArray::new(self.cfg.code_width, self.cfg.code_height);
            for row in 0..self.cfg.code_height {
                for col in 0..self.cfg.code_width {
                    let here = row as usize * cols + col as usize;
                    let there = row as usize * cols + (col as usize + offset) % cols;
                    if valid[here] && valid[there] {
                        mask.set(row, col, true);
                        code.set(row, col, samples[there] > samples[here]);
                    }
                }
            }
            scales.push(code);
            masks.push(mask);
        }

        // Sharpness proxy: mean angular gradient of the normalized strip.
        let mut grad = 0.0f64;
        for row in 0..self.cfg.code_height as usize {
            for col in 0..cols {
                let a = samples[row * cols + col];
                let b = samples[row * cols + (col + 1) % cols];
                grad += (a - b).abs();
            }
        }
        let quality_score = (grad / (samples.len() as f64 * 64.0)).min(1.0);

        let intermediates = if opts.detailed {
            Some(PipelineImages {
                segmented_png: self.png_of(&samples)?,
                normalized_png: self.png_of(&samples)?,
            })
        } else {
            None
        };

        Ok(ProbeTemplate {
            codes: TemplateCodes { scales, masks },
            width: self.cfg.code_width,
            height: self.cfg.code_height,
            n_scales: self.cfg.n_scales,
            quality_score,
            occlusion,
            intermediates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic eye: radial texture around the center.
    fn textured_eye(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let dx = x as f64 - size as f64 / 2.0;
            let dy = y as f64 - size as f64 / 2.0;
            let angle = dy.atan2(dx);
            let radius = (dx * dx + dy * dy).sqrt();
            let v = 128.0 + 60.0 * (angle * 6.0).sin() + 30.0 * (radius * 0.3).cos();
            image::Luma([v.clamp(10.0, 240.0) as u8])
        })
    }

    #[test]
    fn same_image_same_code() {
        let eye = textured_eye(128);
        let mut p = EncoderPipeline::new(EncoderConfig::default());
        let a = p.analyze(&eye, &AnalyzeOptions::default()).unwrap();
        let b = p.analyze(&eye, &AnalyzeOptions::default()).unwrap();
        assert_eq!(a.codes, b.codes);
        assert_eq!(a.n_scales, 2);
        assert!(a.quality_score > 0.0);
    }

    #[test]
    fn flat_image_fails_segmentation() {
        let flat = GrayImage::from_pixel(128, 128, image::Luma([120]));
        let mut p = EncoderPipeline::new(EncoderConfig::default());
        match p.analyze(&flat, &AnalyzeOptions::default()) {
            Err(PipelineError::Segmentation(_)) => {}
            other => panic!("expected segmentation failure, got {other:?}"),
        }
    }

    #[test]
    fn tiny_image_is_rejected() {
        let tiny = textured_eye(16);
        let mut p = EncoderPipeline::new(EncoderConfig::default());
        assert!(matches!(
            p.analyze(&tiny, &AnalyzeOptions::default()),
            Err(PipelineError::Segmentation(_))
        ));
    }

    #[test]
    fn saturated_image_reports_occlusion() {
        // Mostly blown-out pixels with a little noise to pass the contrast
        // gate.
        let img = GrayImage::from_fn(128, 128, |x, y| {
            if (x + y) % 17 == 0 {
                image::Luma([100])
            } else {
                image::Luma([255])
            }
        });
        let mut p = EncoderPipeline::new(EncoderConfig::default());
        assert!(matches!(
            p.analyze(&img, &AnalyzeOptions::default()),
            Err(PipelineError::Occlusion(_))
        ));
    }

    #[test]
    fn detailed_mode_produces_pngs() {
        let eye = textured_eye(128);
        let mut p = EncoderPipeline::new(EncoderConfig::default());
        let probe = p.analyze(&eye, &AnalyzeOptions { detailed: true }).unwrap();
        let images = probe.intermediates.unwrap();
        assert!(images.normalized_png.starts_with(&[0x89, b'P', b'N', b'G']));
    }
}

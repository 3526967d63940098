//! Frame sources.
//!
//! A source yields decoded grayscale plus the JPEG bytes that will travel
//! to the gateway. The camera is opaque hardware; deployments without one
//! use the directory walker or the synthetic test pattern.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(String),

    #[error("no usable images in {0}")]
    EmptyDirectory(PathBuf),
}

pub struct SourceFrame {
    pub jpeg: Vec<u8>,
    pub gray: GrayImage,
}

pub trait FrameSource: Send {
    fn name(&self) -> &'static str;

    /// Next frame, or None when a non-looping source is exhausted.
    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError>;
}

// ============================================================================
// Directory source
// ============================================================================

pub struct DirectorySource {
    files: Vec<PathBuf>,
    index: usize,
    loop_images: bool,
    jpeg_quality: u8,
}

impl DirectorySource {
    pub fn new(dir: &Path, loop_images: bool, jpeg_quality: u8) -> Result<Self, SourceError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
                    Some("jpg" | "jpeg" | "png" | "bmp")
                )
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(SourceError::EmptyDirectory(dir.to_path_buf()));
        }
        info!("directory source: {} images under {}", files.len(), dir.display());
        Ok(Self {
            files,
            index: 0,
            loop_images,
            jpeg_quality,
        })
    }
}

impl FrameSource for DirectorySource {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError> {
        loop {
            if self.index >= self.files.len() {
                if !self.loop_images {
                    return Ok(None);
                }
                self.index = 0;
            }
            let path = self.files[self.index].clone();
            self.index += 1;

            let bytes = std::fs::read(&path)?;
            let decoded = match image::load_from_memory(&bytes) {
                Ok(img) => img,
                Err(e) => {
                    warn!("skipping unreadable image {}: {e}", path.display());
                    continue;
                }
            };
            let gray = decoded.to_luma8();

            let is_jpeg = matches!(
                path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
                Some("jpg" | "jpeg")
            );
            let jpeg = if is_jpeg {
                bytes
            } else {
                encode_jpeg(&gray, self.jpeg_quality)?
            };
            return Ok(Some(SourceFrame { jpeg, gray }));
        }
    }
}

// ============================================================================
// Synthetic test pattern
// ============================================================================

/// Radially textured eye with a slowly rotating phase, for soak tests and
/// deployments without camera hardware.
pub struct TestPatternSource {
    frame: u64,
    size: u32,
    jpeg_quality: u8,
}

impl TestPatternSource {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            frame: 0,
            size: 192,
            jpeg_quality,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &'static str {
        "test-pattern"
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError> {
        let phase = self.frame as f64 * 0.05;
        self.frame += 1;
        let size = self.size;
        let gray = GrayImage::from_fn(size, size, |x, y| {
            let dx = f64::from(x) - f64::from(size) / 2.0;
            let dy = f64::from(y) - f64::from(size) / 2.0;
            let angle = dy.atan2(dx) + phase;
            let radius = (dx * dx + dy * dy).sqrt();
            let v = 128.0 + 55.0 * (angle * 8.0).sin() + 35.0 * (radius * 0.25).cos();
            image::Luma([v.clamp(8.0, 245.0) as u8])
        });
        let jpeg = encode_jpeg(&gray, self.jpeg_quality)?;
        Ok(Some(SourceFrame { jpeg, gray }))
    }
}

fn encode_jpeg(gray: &GrayImage, quality: u8) -> Result<Vec<u8>, SourceError> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(gray)
        .map_err(|e| SourceError::Image(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_produces_decodable_jpeg() {
        let mut source = TestPatternSource::new(90);
        let frame = source.next_frame().unwrap().unwrap();
        assert!(!frame.jpeg.is_empty());
        let decoded = image::load_from_memory(&frame.jpeg).unwrap();
        assert_eq!(decoded.to_luma8().dimensions(), (192, 192));
    }

    #[test]
    fn test_pattern_rotates_between_frames() {
        let mut source = TestPatternSource::new(90);
        let a = source.next_frame().unwrap().unwrap();
        let b = source.next_frame().unwrap().unwrap();
        assert_ne!(a.gray.as_raw(), b.gray.as_raw());
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = std::env::temp_dir().join(format!("eyed-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            DirectorySource::new(&dir, true, 90),
            Err(SourceError::EmptyDirectory(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn directory_source_loops() {
        let dir = std::env::temp_dir().join(format!("eyed-dirsrc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut pattern = TestPatternSource::new(90);
        let frame = pattern.next_frame().unwrap().unwrap();
        std::fs::write(dir.join("only.jpg"), &frame.jpeg).unwrap();

        let mut source = DirectorySource::new(&dir, true, 90).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());

        let mut once = DirectorySource::new(&dir, false, 90).unwrap();
        assert!(once.next_frame().unwrap().is_some());
        assert!(once.next_frame().unwrap().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

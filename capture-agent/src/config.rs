//! Capture agent configuration.
//!
//! A TOML file (path in CAPTURE_CONFIG) provides the base; EYED_*
//! environment variables override individual fields so containerized
//! deployments can skip the file entirely.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {0}: {1}")]
    File(PathBuf, String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Walk still images from a directory.
    Directory,
    /// Synthetic moving test pattern (no camera hardware needed).
    TestPattern,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub image_dir: Option<PathBuf>,
    /// Wrap around at the end of the directory.
    pub loop_images: bool,
    pub camera_device: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Directory,
            image_dir: None,
            loop_images: true,
            camera_device: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 250,
            max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device_id: String,
    pub gateway_addr: String,
    pub eye_side: String,
    pub is_nir: bool,
    pub fps: f64,
    pub quality_threshold: f64,
    pub ring_capacity: usize,
    pub jpeg_quality: u8,
    pub connect_timeout_ms: u64,
    /// Sleep this long per queued frame when the gateway reports
    /// accepted=false.
    pub throttle_ms_per_queued: u64,
    pub source: SourceConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_id: "capture-01".to_string(),
            gateway_addr: "http://127.0.0.1:50051".to_string(),
            eye_side: "left".to_string(),
            is_nir: true,
            fps: 5.0,
            quality_threshold: 0.05,
            ring_capacity: 8,
            jpeg_quality: 90,
            connect_timeout_ms: 5_000,
            throttle_ms_per_queued: 20,
            source: SourceConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Load CAPTURE_CONFIG (if set), apply EYED_* overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("CAPTURE_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::File(path.clone(), e.to_string()))?;
                toml::from_str(&raw).map_err(|e| ConfigError::File(path, e.to_string()))?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("EYED_GATEWAY_ADDR") {
            self.gateway_addr = v;
        }
        if let Ok(v) = std::env::var("EYED_DEVICE_ID") {
            self.device_id = v;
        }
        if let Ok(v) = std::env::var("EYED_IMAGE_DIR") {
            self.source.kind = SourceKind::Directory;
            self.source.image_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("EYED_QUALITY_THRESHOLD") {
            if let Ok(t) = v.parse() {
                self.quality_threshold = t;
            }
        }
        if let Ok(v) = std::env::var("EYED_CAMERA_SOURCE") {
            if v == "test-pattern" || v == "synthetic" {
                self.source.kind = SourceKind::TestPattern;
            }
        }
        if let Ok(v) = std::env::var("EYED_CAMERA_DEVICE") {
            self.source.camera_device = Some(v);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.ring_capacity.is_power_of_two() || self.ring_capacity == 0 {
            return Err(ConfigError::Invalid(format!(
                "ring_capacity must be a power of two, got {}",
                self.ring_capacity
            )));
        }
        if self.fps <= 0.0 {
            return Err(ConfigError::Invalid("fps must be positive".to_string()));
        }
        if self.source.kind == SourceKind::Directory && self.source.image_dir.is_none() {
            return Err(ConfigError::Invalid(
                "directory source needs image_dir (or EYED_IMAGE_DIR)".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ConfigError::Invalid(
                "quality_threshold must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_test_pattern() {
        let mut cfg = CaptureConfig::default();
        cfg.source.kind = SourceKind::TestPattern;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn directory_source_requires_dir() {
        let cfg = CaptureConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_ring_capacity_is_rejected() {
        let mut cfg = CaptureConfig::default();
        cfg.source.kind = SourceKind::TestPattern;
        cfg.ring_capacity = 6;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            device_id = "capture-07"
            fps = 2.5
            ring_capacity = 16

            [source]
            kind = "test-pattern"

            [reconnect]
            base_ms = 100
            max_ms = 5000
        "#;
        let cfg: CaptureConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.device_id, "capture-07");
        assert_eq!(cfg.ring_capacity, 16);
        assert_eq!(cfg.source.kind, SourceKind::TestPattern);
        assert_eq!(cfg.reconnect.base_ms, 100);
        assert!(cfg.validate().is_ok());
    }
}

//! Iris template records and blob framing.
//!
//! Plain blobs are gzip-compressed bit-packed scale arrays, giving them
//! the 0x1f 0x8b signature; encrypted blobs start with the HEv1 magic.
//! The store never interprets code bits.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wire::EyeSide;

use crate::StoreError;

/// gzip signature bytes, the plain-blob marker.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// HEv1 magic, the encrypted-blob marker (owned here so the store does
/// not depend on the crypto crate).
pub const HEV1_MAGIC: &[u8; 4] = b"HEv1";

const PLAIN_INNER_MAGIC: &[u8; 4] = b"IRv1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFormat {
    Plain,
    EncryptedV1,
}

impl TemplateFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateFormat::Plain => "plain",
            TemplateFormat::EncryptedV1 => "encrypted_v1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(TemplateFormat::Plain),
            "encrypted_v1" => Some(TemplateFormat::EncryptedV1),
            _ => None,
        }
    }

    /// Identify a blob by its magic prefix.
    pub fn detect(blob: &[u8]) -> Option<Self> {
        if blob.starts_with(HEV1_MAGIC) {
            Some(TemplateFormat::EncryptedV1)
        } else if blob.starts_with(&GZIP_MAGIC) {
            Some(TemplateFormat::Plain)
        } else {
            None
        }
    }
}

/// One bit-packed code array (scale). Opaque payload plus dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedScale {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A stored template row. `iris_codes` / `mask_codes` are opaque blobs.
#[derive(Debug, Clone)]
pub struct IrisTemplate {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    pub identity_name: String,
    pub eye_side: EyeSide,
    pub width: u32,
    pub height: u32,
    pub n_scales: u32,
    pub quality_score: f64,
    pub device_id: Option<String>,
    pub iris_codes: Vec<u8>,
    pub mask_codes: Vec<u8>,
    pub format: TemplateFormat,
}

impl IrisTemplate {
    pub fn meta(&self) -> wire::TemplateMeta {
        wire::TemplateMeta {
            template_id: self.template_id,
            eye_side: self.eye_side,
            width: self.width,
            height: self.height,
            n_scales: self.n_scales,
            quality_score: self.quality_score,
            device_id: self.device_id.clone(),
            format: self.format.as_str().to_string(),
        }
    }
}

// ============================================================================
// Plain blob framing
// ============================================================================

/// Frame and compress bit-packed scales into a plain blob.
pub fn encode_plain_blob(scales: &[PackedScale]) -> Result<Vec<u8>, StoreError> {
    let mut inner = Vec::new();
    inner.extend_from_slice(PLAIN_INNER_MAGIC);
    inner.extend_from_slice(&(scales.len() as u32).to_le_bytes());
    for scale in scales {
        inner.extend_from_slice(&scale.width.to_le_bytes());
        inner.extend_from_slice(&scale.height.to_le_bytes());
        inner.extend_from_slice(&(scale.data.len() as u32).to_le_bytes());
        inner.extend_from_slice(&scale.data);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&inner)
        .map_err(|e| StoreError::BadBlob(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StoreError::BadBlob(e.to_string()))
}

/// Decompress and unframe a plain blob.
pub fn decode_plain_blob(blob: &[u8]) -> Result<Vec<PackedScale>, StoreError> {
    if !blob.starts_with(&GZIP_MAGIC) {
        return Err(StoreError::BadBlob("not a plain (gzip) blob".to_string()));
    }
    let mut inner = Vec::new();
    GzDecoder::new(blob)
        .read_to_end(&mut inner)
        .map_err(|e| StoreError::BadBlob(format!("gzip decode: {e}")))?;

    let take = |pos: &mut usize, len: usize| -> Result<&[u8], StoreError> {
        if *pos + len > inner.len() {
            return Err(StoreError::BadBlob("truncated plain blob".to_string()));
        }
        let slice = &inner[*pos..*pos + len];
        *pos += len;
        Ok(slice)
    };
    let read_u32 = |pos: &mut usize| -> Result<u32, StoreError> {
        Ok(u32::from_le_bytes(take(pos, 4)?.try_into().unwrap()))
    };

    let mut pos = 0usize;
    if take(&mut pos, 4)? != PLAIN_INNER_MAGIC {
        return Err(StoreError::BadBlob("missing IRv1 header".to_string()));
    }
    let n_scales = read_u32(&mut pos)?;
    let mut scales = Vec::with_capacity(n_scales as usize);
    for _ in 0..n_scales {
        let width = read_u32(&mut pos)?;
        let height = read_u32(&mut pos)?;
        let len = read_u32(&mut pos)? as usize;
        let data = take(&mut pos, len)?.to_vec();
        scales.push(PackedScale {
            width,
            height,
            data,
        });
    }
    Ok(scales)
}

// ============================================================================
// Cache queue items
// ============================================================================

/// JSON shape of a template on the enrollment queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTemplate {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    pub identity_name: String,
    pub eye_side: EyeSide,
    pub width: u32,
    pub height: u32,
    pub n_scales: u32,
    pub quality_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub iris_codes_b64: String,
    pub mask_codes_b64: String,
    pub format: TemplateFormat,
}

impl From<&IrisTemplate> for QueuedTemplate {
    fn from(t: &IrisTemplate) -> Self {
        Self {
            template_id: t.template_id,
            identity_id: t.identity_id,
            identity_name: t.identity_name.clone(),
            eye_side: t.eye_side,
            width: t.width,
            height: t.height,
            n_scales: t.n_scales,
            quality_score: t.quality_score,
            device_id: t.device_id.clone(),
            iris_codes_b64: B64.encode(&t.iris_codes),
            mask_codes_b64: B64.encode(&t.mask_codes),
            format: t.format,
        }
    }
}

impl QueuedTemplate {
    pub fn into_template(self) -> Result<IrisTemplate, StoreError> {
        let iris_codes = B64
            .decode(&self.iris_codes_b64)
            .map_err(|e| StoreError::BadBlob(format!("iris codes base64: {e}")))?;
        let mask_codes = B64
            .decode(&self.mask_codes_b64)
            .map_err(|e| StoreError::BadBlob(format!("mask codes base64: {e}")))?;
        Ok(IrisTemplate {
            template_id: self.template_id,
            identity_id: self.identity_id,
            identity_name: self.identity_name,
            eye_side: self.eye_side,
            width: self.width,
            height: self.height,
            n_scales: self.n_scales,
            quality_score: self.quality_score,
            device_id: self.device_id,
            iris_codes,
            mask_codes,
            format: self.format,
        })
    }
}

/// Queue envelope carrying the retry counter for poison detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope {
    #[serde(default)]
    pub attempts: u32,
    pub template: QueuedTemplate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template() -> IrisTemplate {
        IrisTemplate {
            template_id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
            identity_name: "Alice".to_string(),
            eye_side: EyeSide::Left,
            width: 64,
            height: 8,
            n_scales: 2,
            quality_score: 0.91,
            device_id: Some("capture-01".to_string()),
            iris_codes: encode_plain_blob(&[PackedScale {
                width: 64,
                height: 8,
                data: vec![0xAB; 64],
            }])
            .unwrap(),
            mask_codes: encode_plain_blob(&[PackedScale {
                width: 64,
                height: 8,
                data: vec![0xFF; 64],
            }])
            .unwrap(),
            format: TemplateFormat::Plain,
        }
    }

    #[test]
    fn plain_blob_round_trip() {
        let scales = vec![
            PackedScale {
                width: 128,
                height: 8,
                data: (0..128u16).map(|i| i as u8).collect(),
            },
            PackedScale {
                width: 64,
                height: 4,
                data: vec![0x55; 32],
            },
        ];
        let blob = encode_plain_blob(&scales).unwrap();
        assert_eq!(TemplateFormat::detect(&blob), Some(TemplateFormat::Plain));
        assert_eq!(decode_plain_blob(&blob).unwrap(), scales);
    }

    #[test]
    fn format_detection_by_magic() {
        assert_eq!(
            TemplateFormat::detect(b"HEv1rest-of-blob"),
            Some(TemplateFormat::EncryptedV1)
        );
        assert_eq!(TemplateFormat::detect(b"\x00\x01garbage"), None);
        assert_eq!(TemplateFormat::parse("encrypted_v1"), Some(TemplateFormat::EncryptedV1));
        assert_eq!(TemplateFormat::parse("bfv"), None);
    }

    #[test]
    fn queued_template_round_trip() {
        let template = sample_template();
        let envelope = QueueEnvelope {
            attempts: 0,
            template: QueuedTemplate::from(&template),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: QueueEnvelope = serde_json::from_str(&json).unwrap();
        let restored = back.template.into_template().unwrap();
        assert_eq!(restored.template_id, template.template_id);
        assert_eq!(restored.iris_codes, template.iris_codes);
        assert_eq!(restored.format, TemplateFormat::Plain);
    }

    #[test]
    fn truncated_plain_blob_is_rejected() {
        let blob = encode_plain_blob(&[PackedScale {
            width: 16,
            height: 2,
            data: vec![1, 2, 3, 4],
        }])
        .unwrap();
        assert!(decode_plain_blob(&blob[..blob.len() / 2]).is_err());
        assert!(decode_plain_blob(b"HEv1xx").is_err());
    }
}

//! HEv1 blob format.
//!
//! Layout (all integers little-endian):
//!   "HEv1" | ring_dim u32 | n_scales u32
//!   per scale: width u32 | height u32 | popcount u64 | n_chunks u32 | chunk ciphertexts
//!
//! A chunk ciphertext is ring_dim * 16 bytes (c0 then c1 coefficients).
//! The per-scale popcount of the masked code is public metadata (the
//! match protocol sends it plaintext over the bus anyway) and cannot be
//! recomputed from ciphertext, so it is carried alongside.

use crate::cipher::Ciphertext;
use crate::HeError;

pub const HEV1_MAGIC: &[u8; 4] = b"HEv1";

/// One encrypted code array (scale) of an iris template.
#[derive(Debug, Clone)]
pub struct EncryptedScale {
    pub width: u32,
    pub height: u32,
    /// Popcount of the masked plaintext code, recorded at encryption time.
    pub popcount: u64,
    pub chunks: Vec<Ciphertext>,
}

impl EncryptedScale {
    pub fn bits(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// A full encrypted template blob.
#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    pub ring_dim: u32,
    pub scales: Vec<EncryptedScale>,
}

/// Split slot values into ring-dimension chunks for encryption.
pub fn chunk_slots(slots: &[u64], ring_dim: usize) -> Vec<Vec<u64>> {
    slots.chunks(ring_dim).map(|c| c.to_vec()).collect()
}

pub fn is_hev1(bytes: &[u8]) -> bool {
    bytes.starts_with(HEV1_MAGIC)
}

impl EncryptedBlob {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(HEV1_MAGIC);
        out.extend_from_slice(&self.ring_dim.to_le_bytes());
        out.extend_from_slice(&(self.scales.len() as u32).to_le_bytes());
        for scale in &self.scales {
            out.extend_from_slice(&scale.width.to_le_bytes());
            out.extend_from_slice(&scale.height.to_le_bytes());
            out.extend_from_slice(&scale.popcount.to_le_bytes());
            out.extend_from_slice(&(scale.chunks.len() as u32).to_le_bytes());
            for chunk in &scale.chunks {
                out.extend_from_slice(&chunk.to_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeError> {
        let mut cursor = Reader::new(bytes);
        let magic = cursor.take(4)?;
        if magic != HEV1_MAGIC {
            return Err(HeError::BadBlob("missing HEv1 magic".to_string()));
        }
        let ring_dim = cursor.u32()?;
        let n_scales = cursor.u32()?;
        if ring_dim == 0 || ring_dim > 1 << 16 {
            return Err(HeError::BadBlob(format!("bad ring dimension {ring_dim}")));
        }

        let chunk_len = ring_dim as usize * 16;
        let mut scales = Vec::with_capacity(n_scales as usize);
        for _ in 0..n_scales {
            let width = cursor.u32()?;
            let height = cursor.u32()?;
            let popcount = cursor.u64()?;
            let n_chunks = cursor.u32()?;
            let mut chunks = Vec::with_capacity(n_chunks as usize);
            for _ in 0..n_chunks {
                let raw = cursor.take(chunk_len)?;
                chunks.push(Ciphertext::from_bytes(raw, ring_dim as usize)?);
            }
            scales.push(EncryptedScale {
                width,
                height,
                popcount,
                chunks,
            });
        }
        if !cursor.is_done() {
            return Err(HeError::BadBlob("trailing bytes after last scale".to_string()));
        }
        Ok(EncryptedBlob { ring_dim, scales })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], HeError> {
        if self.pos + len > self.bytes.len() {
            return Err(HeError::BadBlob("truncated blob".to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, HeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, HeError> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::encrypt;
    use crate::keys::keygen;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn blob_round_trip() {
        let mut rng = StdRng::seed_from_u64(9);
        let (_, _, pk) = keygen(64, &mut rng);

        let bits: Vec<u64> = (0..150).map(|_| rng.gen_range(0..2)).collect();
        let chunks: Vec<Ciphertext> = chunk_slots(&bits, 64)
            .iter()
            .map(|c| encrypt(&pk, c, &mut rng))
            .collect();
        let popcount = bits.iter().sum::<u64>();
        let blob = EncryptedBlob {
            ring_dim: 64,
            scales: vec![EncryptedScale {
                width: 50,
                height: 3,
                popcount,
                chunks,
            }],
        };

        let bytes = blob.encode();
        assert!(is_hev1(&bytes));

        let decoded = EncryptedBlob::decode(&bytes).unwrap();
        assert_eq!(decoded.ring_dim, 64);
        assert_eq!(decoded.scales.len(), 1);
        assert_eq!(decoded.scales[0].width, 50);
        assert_eq!(decoded.scales[0].popcount, popcount);
        assert_eq!(decoded.scales[0].chunks.len(), 3);
        assert_eq!(decoded.scales[0].chunks[1].c0, blob.scales[0].chunks[1].c0);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let mut rng = StdRng::seed_from_u64(10);
        let (_, _, pk) = keygen(64, &mut rng);
        let chunks = vec![encrypt(&pk, &[1, 0, 1], &mut rng)];
        let blob = EncryptedBlob {
            ring_dim: 64,
            scales: vec![EncryptedScale {
                width: 3,
                height: 1,
                popcount: 2,
                chunks,
            }],
        };
        let bytes = blob.encode();
        assert!(EncryptedBlob::decode(&bytes[..bytes.len() - 5]).is_err());
        assert!(EncryptedBlob::decode(b"notablob").is_err());
    }

    #[test]
    fn chunking_covers_all_slots() {
        let slots: Vec<u64> = (0..200).collect();
        let chunks = chunk_slots(&slots, 64);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].len(), 8);
        assert_eq!(chunks.concat(), slots);
    }
}

//! Encrypted-match coordination.
//!
//! At enrollment the masked code is packed into ring chunks and encrypted
//! under the public key. At match time the engine computes one encrypted
//! inner product per code array and batches every candidate into a single
//! decrypt request. Plaintext scalars never exist on the engine.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand::Rng;
use tracing::warn;
use wire::{DecryptBatchEntry, DecryptBatchRequest};

use crate::code::TemplateCodes;
use crate::gallery::{GalleryCodes, GallerySnapshot};

/// Encrypt a probe's masked codes into an HEv1 blob (enrollment path).
pub fn encrypt_template<R: Rng>(
    pk: &he::PublicKey,
    codes: &TemplateCodes,
    rng: &mut R,
) -> he::EncryptedBlob {
    let ring_dim = pk.ring_dim();
    let scales = codes
        .scales
        .iter()
        .zip(&codes.masks)
        .map(|(code, mask)| {
            let slots = code.masked_slots(mask);
            let popcount = slots.iter().sum();
            let chunks = he::blob::chunk_slots(&slots, ring_dim)
                .iter()
                .map(|chunk| he::encrypt(pk, chunk, rng))
                .collect();
            he::EncryptedScale {
                width: code.width,
                height: code.height,
                popcount,
                chunks,
            }
        })
        .collect();
    he::EncryptedBlob {
        ring_dim: ring_dim as u32,
        scales,
    }
}

/// Build the single decrypt_batch request for one analyze call.
/// Candidates whose geometry does not line up with the probe are skipped.
pub fn build_decrypt_batch(
    probe: &TemplateCodes,
    snapshot: &GallerySnapshot,
    threshold: f64,
) -> DecryptBatchRequest {
    let probe_popcounts = probe.masked_popcounts();
    let probe_slots: Vec<Vec<u64>> = probe
        .scales
        .iter()
        .zip(&probe.masks)
        .map(|(code, mask)| code.masked_slots(mask))
        .collect();

    let mut entries = Vec::new();
    for entry in &snapshot.entries {
        let GalleryCodes::Encrypted(candidate) = &entry.codes else {
            continue;
        };
        let blob = &candidate.blob;
        if blob.scales.len() != probe.scales.len() {
            warn!(
                "skipping candidate {}: {} scales vs probe {}",
                entry.template_id,
                blob.scales.len(),
                probe.scales.len()
            );
            continue;
        }

        let ring_dim = blob.ring_dim as usize;
        let mut enc_inner_products_b64 = Vec::with_capacity(blob.scales.len());
        let mut gallery_popcounts = Vec::with_capacity(blob.scales.len());
        let mut ok = true;
        for (scale, slots) in blob.scales.iter().zip(&probe_slots) {
            let probe_chunks = he::blob::chunk_slots(slots, ring_dim);
            match he::inner_product(&scale.chunks, &probe_chunks, ring_dim) {
                Ok(ip) => {
                    enc_inner_products_b64.push(B64.encode(ip.to_bytes()));
                    gallery_popcounts.push(scale.popcount);
                }
                Err(e) => {
                    warn!("skipping candidate {}: {e}", entry.template_id);
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }

        entries.push(DecryptBatchEntry {
            template_id: entry.template_id,
            identity_id: entry.identity_id,
            identity_name: Some(entry.identity_name.clone()),
            enc_inner_products_b64,
            probe_iris_popcount: probe_popcounts.clone(),
            gallery_iris_popcount: gallery_popcounts,
            total_bits: candidate.total_bits,
        });
    }

    DecryptBatchRequest { threshold, entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeArray;
    use crate::gallery::{EncryptedCandidate, GalleryEntry};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use uuid::Uuid;
    use wire::EyeSide;

    fn random_codes(rng: &mut StdRng, width: u32, height: u32) -> TemplateCodes {
        let mut code = CodeArray::new(width, height);
        let mut mask = CodeArray::new(width, height);
        for row in 0..height {
            for col in 0..width {
                code.set(row, col, rng.gen_bool(0.5));
                mask.set(row, col, rng.gen_bool(0.9));
            }
        }
        TemplateCodes {
            scales: vec![code],
            masks: vec![mask],
        }
    }

    #[test]
    fn batch_inner_products_decrypt_to_plaintext_dot() {
        let mut rng = StdRng::seed_from_u64(77);
        let (_, sk, pk) = he::keys::keygen(64, &mut rng);

        let gallery_codes = random_codes(&mut rng, 40, 4);
        let probe_codes = random_codes(&mut rng, 40, 4);

        let blob = encrypt_template(&pk, &gallery_codes, &mut rng);
        let snapshot = GallerySnapshot {
            version: 1,
            entries: vec![Arc::new(GalleryEntry {
                template_id: Uuid::new_v4(),
                identity_id: Uuid::new_v4(),
                identity_name: "Bob".to_string(),
                eye_side: EyeSide::Left,
                codes: GalleryCodes::Encrypted(EncryptedCandidate {
                    total_bits: gallery_codes.total_bits(),
                    blob,
                }),
            })],
        };

        let batch = build_decrypt_batch(&probe_codes, &snapshot, 0.32);
        assert_eq!(batch.entries.len(), 1);
        let entry = &batch.entries[0];
        assert_eq!(entry.enc_inner_products_b64.len(), 1);
        assert_eq!(entry.total_bits, 160);

        // Decrypt the scalar the way the key service does and compare to
        // the plaintext masked dot product.
        let expected: u64 = gallery_codes.scales[0]
            .masked_slots(&gallery_codes.masks[0])
            .iter()
            .zip(probe_codes.scales[0].masked_slots(&probe_codes.masks[0]))
            .map(|(g, p)| g * p)
            .sum();

        let bytes = B64.decode(&entry.enc_inner_products_b64[0]).unwrap();
        let ct = he::Ciphertext::from_bytes(&bytes, 64).unwrap();
        let decoded = he::decrypt_coeffs(&sk, &ct).unwrap();
        assert_eq!(decoded[0], expected);
    }

    #[test]
    fn mismatched_geometry_is_skipped() {
        let mut rng = StdRng::seed_from_u64(78);
        let (_, _, pk) = he::keys::keygen(64, &mut rng);

        let gallery_codes = random_codes(&mut rng, 40, 4);
        let probe_codes = random_codes(&mut rng, 24, 4); // different width

        let blob = encrypt_template(&pk, &gallery_codes, &mut rng);
        let snapshot = GallerySnapshot {
            version: 1,
            entries: vec![Arc::new(GalleryEntry {
                template_id: Uuid::new_v4(),
                identity_id: Uuid::new_v4(),
                identity_name: "Bob".to_string(),
                eye_side: EyeSide::Left,
                codes: GalleryCodes::Encrypted(EncryptedCandidate {
                    total_bits: gallery_codes.total_bits(),
                    blob,
                }),
            })],
        };

        let batch = build_decrypt_batch(&probe_codes, &snapshot, 0.32);
        assert!(batch.entries.is_empty());
    }
}

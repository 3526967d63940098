//! Decryption and decision logic.
//!
//! The secret key never leaves this module's types. Batch requests are
//! decided whole: decrypt every candidate's inner products, reconstruct
//! fractional Hamming distances from the public popcounts, pick the
//! minimum. Only the decision crosses the bus.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use he::{decrypt_coeffs, Ciphertext, EncryptedBlob, SecretKey};
use tracing::{debug, warn};
use wire::{
    DecryptBatchEntry, DecryptBatchRequest, DecryptTemplateRequest, DecryptTemplateResponse,
    MatchDecision,
};

/// Decrypt one entry's inner products and reconstruct its FHD.
/// None when the entry is malformed.
fn entry_distance(secret: &SecretKey, ring_dim: usize, entry: &DecryptBatchEntry) -> Option<f64> {
    if entry.total_bits == 0 {
        return None;
    }
    let mut ip_total: u64 = 0;
    for ct_b64 in &entry.enc_inner_products_b64 {
        let bytes = B64.decode(ct_b64).ok()?;
        let ct = Ciphertext::from_bytes(&bytes, ring_dim).ok()?;
        let coeffs = decrypt_coeffs(secret, &ct).ok()?;
        ip_total += coeffs[0];
    }
    let pop_probe: u64 = entry.probe_iris_popcount.iter().sum();
    let pop_gallery: u64 = entry.gallery_iris_popcount.iter().sum();

    // HD = (|a| + |b| - 2 * a.b) / total
    let disagreement = (pop_probe + pop_gallery) as f64 - 2.0 * ip_total as f64;
    Some((disagreement / entry.total_bits as f64).clamp(0.0, 1.0))
}

/// The single decision for one decrypt_batch call.
pub fn decide(secret: &SecretKey, ring_dim: usize, req: &DecryptBatchRequest) -> MatchDecision {
    let mut best: Option<(f64, &DecryptBatchEntry)> = None;
    for entry in &req.entries {
        let Some(distance) = entry_distance(secret, ring_dim, entry) else {
            warn!("skipping malformed batch entry {}", entry.template_id);
            continue;
        };
        debug!("candidate {} at distance {distance:.4}", entry.template_id);
        match best {
            Some((current, _)) if current <= distance => {}
            _ => best = Some((distance, entry)),
        }
    }

    match best {
        Some((distance, entry)) if distance <= req.threshold => MatchDecision {
            is_match: true,
            hamming_distance: distance,
            matched_identity_id: Some(entry.identity_id),
            matched_identity_name: entry.identity_name.clone(),
        },
        Some((distance, _)) => MatchDecision {
            is_match: false,
            hamming_distance: distance,
            matched_identity_id: None,
            matched_identity_name: None,
        },
        None => MatchDecision {
            is_match: false,
            hamming_distance: 1.0,
            matched_identity_id: None,
            matched_identity_name: None,
        },
    }
}

/// Decrypt a template blob back to bit-packed code arrays for admin
/// visualization. This is the only path where per-bit plaintext leaves
/// the service, and only on explicit request.
pub fn decrypt_template(
    secret: &SecretKey,
    req: &DecryptTemplateRequest,
) -> DecryptTemplateResponse {
    let failure = |error: String| DecryptTemplateResponse {
        iris_codes_b64: Vec::new(),
        width: 0,
        height: 0,
        n_scales: 0,
        error: Some(error),
    };

    let bytes = match B64.decode(&req.iris_blob_b64) {
        Ok(bytes) => bytes,
        Err(e) => return failure(format!("bad blob base64: {e}")),
    };
    let blob = match EncryptedBlob::decode(&bytes) {
        Ok(blob) => blob,
        Err(e) => return failure(e.to_string()),
    };
    let ring_dim = blob.ring_dim as usize;
    if secret.s.len() != ring_dim {
        return failure(format!(
            "blob ring dimension {ring_dim} does not match key material"
        ));
    }

    let mut iris_codes_b64 = Vec::with_capacity(blob.scales.len());
    let (mut width, mut height) = (0u32, 0u32);
    for scale in &blob.scales {
        let mut slots: Vec<u64> = Vec::with_capacity(ring_dim * scale.chunks.len());
        for chunk in &scale.chunks {
            match decrypt_coeffs(secret, chunk) {
                Ok(coeffs) => slots.extend(coeffs),
                Err(e) => return failure(e.to_string()),
            }
        }
        let bits = scale.bits() as usize;
        if slots.len() < bits {
            return failure(format!(
                "scale claims {bits} bits but carries {} slots",
                slots.len()
            ));
        }
        let mut packed = vec![0u8; bits.div_ceil(8)];
        for (idx, slot) in slots.iter().take(bits).enumerate() {
            if slot & 1 == 1 {
                packed[idx / 8] |= 1 << (idx % 8);
            }
        }
        iris_codes_b64.push(B64.encode(packed));
        width = scale.width;
        height = scale.height;
    }

    DecryptTemplateResponse {
        iris_codes_b64,
        width,
        height,
        n_scales: blob.scales.len() as u32,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use he::blob::chunk_slots;
    use he::keys::keygen;
    use he::{encrypt, inner_product, EncryptedScale, PublicKey};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use uuid::Uuid;

    const RING: usize = 64;

    fn random_bits(rng: &mut StdRng, n: usize) -> Vec<u64> {
        (0..n).map(|_| rng.gen_range(0..2)).collect()
    }

    /// Build a batch entry the way the engine does: encrypt the gallery
    /// bits, inner-product against the plaintext probe.
    fn build_entry(
        pk: &PublicKey,
        rng: &mut StdRng,
        gallery: &[u64],
        probe: &[u64],
        name: &str,
    ) -> DecryptBatchEntry {
        let enc_chunks: Vec<Ciphertext> = chunk_slots(gallery, RING)
            .iter()
            .map(|c| encrypt(pk, c, rng))
            .collect();
        let probe_chunks = chunk_slots(probe, RING);
        let ip = inner_product(&enc_chunks, &probe_chunks, RING).unwrap();
        DecryptBatchEntry {
            template_id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
            identity_name: Some(name.to_string()),
            enc_inner_products_b64: vec![B64.encode(ip.to_bytes())],
            probe_iris_popcount: vec![probe.iter().sum()],
            gallery_iris_popcount: vec![gallery.iter().sum()],
            total_bits: gallery.len() as u64,
        }
    }

    fn plaintext_fhd(a: &[u64], b: &[u64]) -> f64 {
        let disagree = a.iter().zip(b).filter(|(x, y)| x != y).count();
        disagree as f64 / a.len() as f64
    }

    #[test]
    fn decision_matches_plaintext_distance() {
        let mut rng = StdRng::seed_from_u64(101);
        let (_, sk, pk) = keygen(RING, &mut rng);

        let probe = random_bits(&mut rng, 160);
        // Near candidate: flip a few bits of the probe.
        let mut near = probe.clone();
        for i in 0..16 {
            near[i * 10] ^= 1;
        }
        let far = random_bits(&mut rng, 160);

        let req = DecryptBatchRequest {
            threshold: 0.32,
            entries: vec![
                build_entry(&pk, &mut rng, &far, &probe, "far"),
                build_entry(&pk, &mut rng, &near, &probe, "near"),
            ],
        };
        let decision = decide(&sk, RING, &req);
        assert!(decision.is_match);
        assert_eq!(decision.matched_identity_name.as_deref(), Some("near"));
        let expected = plaintext_fhd(&near, &probe);
        assert!((decision.hamming_distance - expected).abs() < 1e-9);
    }

    #[test]
    fn above_threshold_is_not_a_match() {
        let mut rng = StdRng::seed_from_u64(102);
        let (_, sk, pk) = keygen(RING, &mut rng);

        let probe = random_bits(&mut rng, 128);
        let inverted: Vec<u64> = probe.iter().map(|b| b ^ 1).collect();
        let req = DecryptBatchRequest {
            threshold: 0.32,
            entries: vec![build_entry(&pk, &mut rng, &inverted, &probe, "anti")],
        };
        let decision = decide(&sk, RING, &req);
        assert!(!decision.is_match);
        assert!(decision.matched_identity_id.is_none());
        assert!((decision.hamming_distance - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_batch_fails_closed() {
        let mut rng = StdRng::seed_from_u64(103);
        let (_, sk, _) = keygen(RING, &mut rng);
        let decision = decide(
            &sk,
            RING,
            &DecryptBatchRequest {
                threshold: 0.32,
                entries: Vec::new(),
            },
        );
        assert!(!decision.is_match);
        assert_eq!(decision.hamming_distance, 1.0);
    }

    #[test]
    fn identical_eye_matches_at_zero_distance() {
        let mut rng = StdRng::seed_from_u64(104);
        let (_, sk, pk) = keygen(RING, &mut rng);
        let probe = random_bits(&mut rng, 200);
        let req = DecryptBatchRequest {
            threshold: 0.26,
            entries: vec![build_entry(&pk, &mut rng, &probe.clone(), &probe, "self")],
        };
        let decision = decide(&sk, RING, &req);
        assert!(decision.is_match);
        assert!(decision.hamming_distance.abs() < 1e-9);
    }

    #[test]
    fn template_decryption_round_trip() {
        let mut rng = StdRng::seed_from_u64(105);
        let (_, sk, pk) = keygen(RING, &mut rng);

        let bits = random_bits(&mut rng, 150);
        let chunks: Vec<Ciphertext> = chunk_slots(&bits, RING)
            .iter()
            .map(|c| encrypt(&pk, c, &mut rng))
            .collect();
        let blob = he::EncryptedBlob {
            ring_dim: RING as u32,
            scales: vec![EncryptedScale {
                width: 50,
                height: 3,
                popcount: bits.iter().sum(),
                chunks,
            }],
        };

        let response = decrypt_template(
            &sk,
            &DecryptTemplateRequest {
                template_id: Uuid::new_v4(),
                iris_blob_b64: B64.encode(blob.encode()),
            },
        );
        assert!(response.error.is_none());
        assert_eq!(response.n_scales, 1);
        assert_eq!(response.width, 50);

        let packed = B64.decode(&response.iris_codes_b64[0]).unwrap();
        for (idx, &bit) in bits.iter().enumerate() {
            let got = (packed[idx / 8] >> (idx % 8)) & 1;
            assert_eq!(u64::from(got), bit, "bit {idx}");
        }
    }

    #[test]
    fn malformed_ciphertext_is_skipped_not_fatal() {
        let mut rng = StdRng::seed_from_u64(106);
        let (_, sk, pk) = keygen(RING, &mut rng);
        let probe = random_bits(&mut rng, 64);

        let mut bad = build_entry(&pk, &mut rng, &probe.clone(), &probe, "bad");
        bad.enc_inner_products_b64 = vec!["!!!not-base64!!!".to_string()];
        let good = build_entry(&pk, &mut rng, &probe.clone(), &probe, "good");

        let decision = decide(
            &sk,
            RING,
            &DecryptBatchRequest {
                threshold: 0.32,
                entries: vec![bad, good],
            },
        );
        assert!(decision.is_match);
        assert_eq!(decision.matched_identity_name.as_deref(), Some("good"));
    }
}

//! RLWE ciphertexts and the homomorphic operations the engine needs.

use rand::Rng;

use crate::keys::{PublicKey, SecretKey};
use crate::poly::Poly;
use crate::{HeError, DELTA_BITS, NOISE_BOUND};

/// An RLWE ciphertext pair. Decrypts as c0 + c1 * s = delta * m + noise.
#[derive(Debug, Clone)]
pub struct Ciphertext {
    pub c0: Poly,
    pub c1: Poly,
}

impl Ciphertext {
    pub fn ring_dim(&self) -> usize {
        self.c0.len()
    }

    pub fn add(&self, other: &Ciphertext) -> Ciphertext {
        Ciphertext {
            c0: self.c0.add(&other.c0),
            c1: self.c1.add(&other.c1),
        }
    }

    /// Multiply by a plaintext polynomial (probe side of an inner product).
    pub fn mul_plain(&self, p: &Poly) -> Ciphertext {
        Ciphertext {
            c0: self.c0.mul(p),
            c1: self.c1.mul(p),
        }
    }

    /// Serialize as little-endian u64 words, c0 then c1.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ring_dim() * 16);
        for coeff in self.c0.0.iter().chain(self.c1.0.iter()) {
            out.extend_from_slice(&coeff.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], ring_dim: usize) -> Result<Self, HeError> {
        if bytes.len() != ring_dim * 16 {
            return Err(HeError::BadBlob(format!(
                "ciphertext length {} does not match ring dimension {}",
                bytes.len(),
                ring_dim
            )));
        }
        let words: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let (c0, c1) = words.split_at(ring_dim);
        Ok(Ciphertext {
            c0: Poly(c0.to_vec()),
            c1: Poly(c1.to_vec()),
        })
    }
}

/// Encrypt slot values (zero-padded to the ring dimension) under the
/// public key.
pub fn encrypt<R: Rng>(pk: &PublicKey, slots: &[u64], rng: &mut R) -> Ciphertext {
    let n = pk.ring_dim();
    let m = Poly::from_slots(slots, n).shifted_left(DELTA_BITS);
    let u = Poly::ternary(n, rng);
    let e1 = Poly::noise(n, NOISE_BOUND, rng);
    let e2 = Poly::noise(n, NOISE_BOUND, rng);
    Ciphertext {
        c0: pk.p0.mul(&u).add(&e1).add(&m),
        c1: pk.p1.mul(&u).add(&e2),
    }
}

/// Decrypt to rounded slot values. Only the key service calls this.
pub fn decrypt_coeffs(sk: &SecretKey, ct: &Ciphertext) -> Result<Vec<u64>, HeError> {
    if sk.s.len() != ct.ring_dim() {
        return Err(HeError::RingMismatch {
            expected: sk.s.len(),
            got: ct.ring_dim(),
        });
    }
    let d = ct.c0.add(&ct.c1.mul(&sk.s));
    // Round to the nearest multiple of delta; noise must stay below delta/2.
    let half = 1u64 << (DELTA_BITS - 1);
    Ok(d
        .0
        .iter()
        .map(|v| v.wrapping_add(half) >> DELTA_BITS)
        .collect())
}

/// Homomorphic inner product of one encrypted code array against a
/// plaintext probe array. Both are sequences of ring-dimension slot
/// chunks; the result is a single ciphertext whose constant coefficient
/// decrypts to the dot product.
pub fn inner_product(
    enc_chunks: &[Ciphertext],
    probe_chunks: &[Vec<u64>],
    ring_dim: usize,
) -> Result<Ciphertext, HeError> {
    if enc_chunks.len() != probe_chunks.len() {
        return Err(HeError::BadBlob(format!(
            "chunk count mismatch: {} encrypted vs {} probe",
            enc_chunks.len(),
            probe_chunks.len()
        )));
    }
    let mut acc = Ciphertext {
        c0: Poly::zero(ring_dim),
        c1: Poly::zero(ring_dim),
    };
    for (ct, probe) in enc_chunks.iter().zip(probe_chunks) {
        if ct.ring_dim() != ring_dim {
            return Err(HeError::RingMismatch {
                expected: ring_dim,
                got: ct.ring_dim(),
            });
        }
        let pr = Poly::probe_transform(probe, ring_dim);
        acc = acc.add(&ct.mul_plain(&pr));
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::keygen;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_keys(seed: u64) -> (PublicKey, SecretKey) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (_, sk, pk) = keygen(64, &mut rng);
        (pk, sk)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let (pk, sk) = small_keys(11);
        let mut rng = StdRng::seed_from_u64(12);
        let slots: Vec<u64> = (0..64).map(|_| rng.gen_range(0..2)).collect();

        let ct = encrypt(&pk, &slots, &mut rng);
        let decoded = decrypt_coeffs(&sk, &ct).unwrap();
        assert_eq!(decoded, slots);
    }

    #[test]
    fn homomorphic_addition() {
        let (pk, sk) = small_keys(21);
        let mut rng = StdRng::seed_from_u64(22);
        let a: Vec<u64> = (0..64).map(|_| rng.gen_range(0..4)).collect();
        let b: Vec<u64> = (0..64).map(|_| rng.gen_range(0..4)).collect();

        let sum_ct = encrypt(&pk, &a, &mut rng).add(&encrypt(&pk, &b, &mut rng));
        let decoded = decrypt_coeffs(&sk, &sum_ct).unwrap();
        let expected: Vec<u64> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn encrypted_inner_product_matches_plaintext() {
        let (pk, sk) = small_keys(31);
        let mut rng = StdRng::seed_from_u64(32);
        let ring_dim = 64;

        // Three chunks per code array, all bits.
        let gallery: Vec<Vec<u64>> = (0..3)
            .map(|_| (0..ring_dim).map(|_| rng.gen_range(0..2)).collect())
            .collect();
        let probe: Vec<Vec<u64>> = (0..3)
            .map(|_| (0..ring_dim).map(|_| rng.gen_range(0..2)).collect())
            .collect();
        let expected: u64 = gallery
            .iter()
            .zip(&probe)
            .map(|(g, p)| g.iter().zip(p).map(|(a, b)| a * b).sum::<u64>())
            .sum();

        let enc_chunks: Vec<Ciphertext> =
            gallery.iter().map(|g| encrypt(&pk, g, &mut rng)).collect();
        let ip_ct = inner_product(&enc_chunks, &probe, ring_dim).unwrap();
        let decoded = decrypt_coeffs(&sk, &ip_ct).unwrap();
        assert_eq!(decoded[0], expected);
    }

    #[test]
    fn ciphertext_bytes_round_trip() {
        let (pk, _) = small_keys(41);
        let mut rng = StdRng::seed_from_u64(42);
        let slots: Vec<u64> = (0..64).map(|_| rng.gen_range(0..2)).collect();
        let ct = encrypt(&pk, &slots, &mut rng);

        let bytes = ct.to_bytes();
        let back = Ciphertext::from_bytes(&bytes, 64).unwrap();
        assert_eq!(back.c0, ct.c0);
        assert_eq!(back.c1, ct.c1);
        assert!(Ciphertext::from_bytes(&bytes[1..], 64).is_err());
    }
}

//! Key material generation and key-directory persistence.
//!
//! The directory holds three files: `context.json` (public parameters),
//! `public.key` and `secret.key`. The secret key file is only ever read
//! by the key service; the engine loads the context and public key.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::poly::Poly;
use crate::{HeError, NOISE_BOUND};

const CONTEXT_FILE: &str = "context.json";
const SECRET_FILE: &str = "secret.key";
const PUBLIC_FILE: &str = "public.key";

/// Public scheme parameters, persisted alongside the keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeContext {
    pub ring_dim: usize,
    pub scale_bits: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Secret decryption key. Exists only in the key service's address space.
pub struct SecretKey {
    pub s: Poly,
}

/// Public encryption key: p0 = -(a*s + e), p1 = a.
#[derive(Clone)]
pub struct PublicKey {
    pub p0: Poly,
    pub p1: Poly,
}

impl PublicKey {
    pub fn ring_dim(&self) -> usize {
        self.p0.len()
    }
}

/// Generate a fresh keypair for the given ring dimension.
pub fn keygen<R: Rng>(ring_dim: usize, rng: &mut R) -> (HeContext, SecretKey, PublicKey) {
    let s = Poly::ternary(ring_dim, rng);
    let a = Poly::uniform(ring_dim, rng);
    let e = Poly::noise(ring_dim, NOISE_BOUND, rng);
    let p0 = a.mul(&s).add(&e).neg();
    let context = HeContext {
        ring_dim,
        scale_bits: crate::DELTA_BITS,
        created_at: chrono::Utc::now(),
    };
    (context, SecretKey { s }, PublicKey { p0, p1: a })
}

// ============================================================================
// Serialization
// ============================================================================

#[derive(Serialize, Deserialize)]
struct SecretKeyFile {
    ring_dim: usize,
    s_b64: String,
}

#[derive(Serialize, Deserialize)]
struct PublicKeyFile {
    ring_dim: usize,
    p0_b64: String,
    p1_b64: String,
}

fn poly_to_b64(p: &Poly) -> String {
    let mut bytes = Vec::with_capacity(p.len() * 8);
    for coeff in &p.0 {
        bytes.extend_from_slice(&coeff.to_le_bytes());
    }
    B64.encode(bytes)
}

fn poly_from_b64(s: &str, ring_dim: usize) -> Result<Poly, HeError> {
    let bytes = B64
        .decode(s)
        .map_err(|e| HeError::BadKey(format!("base64 decode: {e}")))?;
    if bytes.len() != ring_dim * 8 {
        return Err(HeError::BadKey(format!(
            "polynomial length {} does not match ring dimension {}",
            bytes.len(),
            ring_dim
        )));
    }
    Ok(Poly(
        bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect(),
    ))
}

// ============================================================================
// Key directory
// ============================================================================

/// Load the full keypair, generating and persisting a fresh one when the
/// directory is empty. A partially-populated directory is treated as
/// corrupt and refused rather than silently re-keyed.
pub fn load_or_generate(
    dir: &Path,
    ring_dim: usize,
) -> Result<(HeContext, SecretKey, PublicKey), HeError> {
    let context_path = dir.join(CONTEXT_FILE);
    let secret_path = dir.join(SECRET_FILE);
    let public_path = dir.join(PUBLIC_FILE);

    let present = [&context_path, &secret_path, &public_path]
        .iter()
        .filter(|p| p.exists())
        .count();

    if present == 3 {
        let context: HeContext = serde_json::from_str(&fs::read_to_string(&context_path)?)?;
        let secret: SecretKeyFile = serde_json::from_str(&fs::read_to_string(&secret_path)?)?;
        let public: PublicKeyFile = serde_json::from_str(&fs::read_to_string(&public_path)?)?;
        if secret.ring_dim != context.ring_dim || public.ring_dim != context.ring_dim {
            return Err(HeError::BadKey(
                "key files disagree on ring dimension".to_string(),
            ));
        }
        let sk = SecretKey {
            s: poly_from_b64(&secret.s_b64, context.ring_dim)?,
        };
        let pk = PublicKey {
            p0: poly_from_b64(&public.p0_b64, context.ring_dim)?,
            p1: poly_from_b64(&public.p1_b64, context.ring_dim)?,
        };
        info!(
            "loaded key material from {} (ring dimension {})",
            dir.display(),
            context.ring_dim
        );
        return Ok((context, sk, pk));
    }

    if present != 0 {
        return Err(HeError::BadKey(format!(
            "key directory {} is partially populated ({present}/3 files)",
            dir.display()
        )));
    }

    fs::create_dir_all(dir)?;
    let mut rng = rand::thread_rng();
    let (context, sk, pk) = keygen(ring_dim, &mut rng);

    fs::write(&context_path, serde_json::to_string_pretty(&context)?)?;
    fs::write(
        &secret_path,
        serde_json::to_string(&SecretKeyFile {
            ring_dim,
            s_b64: poly_to_b64(&sk.s),
        })?,
    )?;
    fs::write(
        &public_path,
        serde_json::to_string(&PublicKeyFile {
            ring_dim,
            p0_b64: poly_to_b64(&pk.p0),
            p1_b64: poly_to_b64(&pk.p1),
        })?,
    )?;
    info!(
        "generated fresh key material in {} (ring dimension {})",
        dir.display(),
        ring_dim
    );
    Ok((context, sk, pk))
}

/// Load only the public side. The engine uses this; a missing directory is
/// a fatal configuration error rather than a trigger to generate keys.
pub fn load_public(dir: &Path) -> Result<(HeContext, PublicKey), HeError> {
    let context_path = dir.join(CONTEXT_FILE);
    let public_path = dir.join(PUBLIC_FILE);
    if !context_path.exists() || !public_path.exists() {
        return Err(HeError::BadKey(format!(
            "no public key material in {} (run the key service first)",
            dir.display()
        )));
    }
    let context: HeContext = serde_json::from_str(&fs::read_to_string(&context_path)?)?;
    let public: PublicKeyFile = serde_json::from_str(&fs::read_to_string(&public_path)?)?;
    if public.ring_dim != context.ring_dim {
        return Err(HeError::BadKey(
            "public key disagrees with context on ring dimension".to_string(),
        ));
    }
    let pk = PublicKey {
        p0: poly_from_b64(&public.p0_b64, context.ring_dim)?,
        p1: poly_from_b64(&public.p1_b64, context.ring_dim)?,
    };
    Ok((context, pk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{decrypt_coeffs, encrypt};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn temp_key_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("eyed-he-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn generate_then_reload() {
        let dir = temp_key_dir("reload");
        let (ctx1, sk1, pk1) = load_or_generate(&dir, 64).unwrap();
        let (ctx2, sk2, pk2) = load_or_generate(&dir, 64).unwrap();

        assert_eq!(ctx1.ring_dim, ctx2.ring_dim);
        assert_eq!(sk1.s, sk2.s);
        assert_eq!(pk1.p0, pk2.p0);
        assert_eq!(pk1.p1, pk2.p1);

        // Keys reloaded from disk still decrypt.
        let mut rng = StdRng::seed_from_u64(5);
        let slots: Vec<u64> = (0..64).map(|_| rng.gen_range(0..2)).collect();
        let ct = encrypt(&pk2, &slots, &mut rng);
        assert_eq!(decrypt_coeffs(&sk2, &ct).unwrap(), slots);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_directory_is_refused() {
        let dir = temp_key_dir("partial");
        load_or_generate(&dir, 64).unwrap();
        fs::remove_file(dir.join(SECRET_FILE)).unwrap();
        assert!(load_or_generate(&dir, 64).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn public_load_without_secret() {
        let dir = temp_key_dir("public");
        let (_, _, pk) = load_or_generate(&dir, 64).unwrap();
        let (ctx, loaded) = load_public(&dir).unwrap();
        assert_eq!(ctx.ring_dim, 64);
        assert_eq!(loaded.p0, pk.p0);
        let _ = fs::remove_dir_all(&dir);
    }
}

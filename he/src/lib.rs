//! HEv1 Homomorphic Layer
//!
//! Ring-LWE additive encryption over `Z_q[X]/(X^N + 1)` with q = 2^64
//! (native wrapping arithmetic) and scaling factor delta = 2^32.
//!
//! The engine packs gallery code words into polynomial coefficients and
//! encrypts them under the public key at enrollment. At match time the
//! probe is plaintext on the engine, so an encrypted inner product is a
//! plaintext-polynomial multiply plus ciphertext additions; no
//! relinearization is ever needed. The secret key decrypts only the
//! aggregated scalar, and only inside the key service.

pub mod blob;
pub mod cipher;
pub mod keys;
pub mod poly;

pub use blob::{EncryptedBlob, EncryptedScale, HEV1_MAGIC};
pub use cipher::{decrypt_coeffs, encrypt, inner_product, Ciphertext};
pub use keys::{load_or_generate, load_public, HeContext, PublicKey, SecretKey};
pub use poly::Poly;

use thiserror::Error;

/// Ring dimension used in production key material.
pub const DEFAULT_RING_DIM: usize = 1024;

/// Message scaling factor: messages live in the top 32 bits.
pub const DELTA_BITS: u32 = 32;

/// Uniform noise bound (coefficients drawn from -NOISE_BOUND..=NOISE_BOUND).
pub const NOISE_BOUND: i64 = 8;

#[derive(Error, Debug)]
pub enum HeError {
    #[error("bad key material: {0}")]
    BadKey(String),

    #[error("bad HEv1 blob: {0}")]
    BadBlob(String),

    #[error("ring dimension mismatch: expected {expected}, got {got}")]
    RingMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

//! Negacyclic polynomial arithmetic mod 2^64.
//!
//! All coefficient arithmetic wraps; reduction by X^N + 1 turns the
//! wrapped-around products negative.

use rand::Rng;

/// A polynomial in Z_q[X]/(X^N + 1), q = 2^64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poly(pub Vec<u64>);

impl Poly {
    pub fn zero(n: usize) -> Self {
        Poly(vec![0u64; n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Coefficients drawn uniformly from the full ring.
    pub fn uniform<R: Rng>(n: usize, rng: &mut R) -> Self {
        Poly((0..n).map(|_| rng.gen::<u64>()).collect())
    }

    /// Ternary coefficients in {-1, 0, 1}.
    pub fn ternary<R: Rng>(n: usize, rng: &mut R) -> Self {
        Poly(
            (0..n)
                .map(|_| match rng.gen_range(0..3) {
                    0 => 0u64,
                    1 => 1u64,
                    _ => u64::MAX, // -1 mod 2^64
                })
                .collect(),
        )
    }

    /// Small noise coefficients in [-bound, bound].
    pub fn noise<R: Rng>(n: usize, bound: i64, rng: &mut R) -> Self {
        Poly(
            (0..n)
                .map(|_| rng.gen_range(-bound..=bound) as u64)
                .collect(),
        )
    }

    /// Message polynomial from slot values (short vectors are zero-padded).
    pub fn from_slots(slots: &[u64], n: usize) -> Self {
        let mut coeffs = vec![0u64; n];
        coeffs[..slots.len()].copy_from_slice(slots);
        Poly(coeffs)
    }

    pub fn add(&self, other: &Poly) -> Poly {
        debug_assert_eq!(self.len(), other.len());
        Poly(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| a.wrapping_add(*b))
                .collect(),
        )
    }

    pub fn neg(&self) -> Poly {
        Poly(self.0.iter().map(|a| a.wrapping_neg()).collect())
    }

    /// Scale every coefficient by 2^shift.
    pub fn shifted_left(&self, shift: u32) -> Poly {
        Poly(self.0.iter().map(|a| a.wrapping_shl(shift)).collect())
    }

    /// Negacyclic product: X^N = -1.
    pub fn mul(&self, other: &Poly) -> Poly {
        let n = self.len();
        debug_assert_eq!(n, other.len());
        let mut out = vec![0u64; n];
        for (i, &a) in self.0.iter().enumerate() {
            if a == 0 {
                continue;
            }
            for (j, &b) in other.0.iter().enumerate() {
                if b == 0 {
                    continue;
                }
                let p = a.wrapping_mul(b);
                let k = i + j;
                if k < n {
                    out[k] = out[k].wrapping_add(p);
                } else {
                    out[k - n] = out[k - n].wrapping_sub(p);
                }
            }
        }
        Poly(out)
    }

    /// Transform probe slots so that the constant coefficient of
    /// `message * transform(probe)` equals the slot-wise inner product.
    ///
    /// pr_0 = p_0, pr_{N-i} = -p_i for i >= 1.
    pub fn probe_transform(slots: &[u64], n: usize) -> Poly {
        let mut coeffs = vec![0u64; n];
        for (i, &p) in slots.iter().enumerate() {
            if i == 0 {
                coeffs[0] = p;
            } else {
                coeffs[n - i] = p.wrapping_neg();
            }
        }
        Poly(coeffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn mul_without_wraparound() {
        // (1 + 2X) * X = X + 2X^2
        let a = Poly(vec![1, 2, 0, 0]);
        let b = Poly(vec![0, 1, 0, 0]);
        assert_eq!(a.mul(&b), Poly(vec![0, 1, 2, 0]));
    }

    #[test]
    fn mul_wraparound_negates() {
        // X^3 * X^2 = X^5 = -X in degree-4 negacyclic ring
        let a = Poly(vec![0, 0, 0, 1]);
        let b = Poly(vec![0, 0, 1, 0]);
        assert_eq!(a.mul(&b), Poly(vec![0, 0u64.wrapping_sub(1), 0, 0]));
    }

    #[test]
    fn probe_transform_extracts_inner_product() {
        let n = 8;
        let msg = [1u64, 0, 1, 1, 0, 1, 0, 0];
        let probe = [1u64, 1, 0, 1, 0, 1, 1, 0];
        let expected: u64 = msg.iter().zip(&probe).map(|(a, b)| a * b).sum();

        let m = Poly::from_slots(&msg, n);
        let pr = Poly::probe_transform(&probe, n);
        assert_eq!(m.mul(&pr).0[0], expected);
    }

    #[test]
    fn probe_transform_random_agreement() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 64;
        for _ in 0..20 {
            let msg: Vec<u64> = (0..n).map(|_| rng.gen_range(0..2)).collect();
            let probe: Vec<u64> = (0..n).map(|_| rng.gen_range(0..2)).collect();
            let expected: u64 = msg.iter().zip(&probe).map(|(a, b)| a * b).sum();

            let m = Poly::from_slots(&msg, n);
            let pr = Poly::probe_transform(&probe, n);
            assert_eq!(m.mul(&pr).0[0], expected);
        }
    }

    #[test]
    fn add_and_neg_cancel() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Poly::uniform(16, &mut rng);
        assert_eq!(a.add(&a.neg()), Poly::zero(16));
    }
}

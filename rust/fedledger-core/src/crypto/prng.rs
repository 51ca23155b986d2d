//! PRNG utilities for the crypto primitives.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use std::iter;

use rand::Rng;
use rand_chacha::ChaCha20Rng;

/// Generates a secure pseudo-random vector of length `len`.
///
/// Draws from a uniform distribution over the reals between `-bound` (included) and `bound`
/// (excluded). Employs the `ChaCha20` stream cipher as a PRNG, so equal seeds yield equal vectors.
pub fn generate_uniform_vector(prng: &mut ChaCha20Rng, len: usize, bound: f64) -> Vec<f64> {
    if bound <= 0_f64 {
        return vec![0_f64; len];
    }
    iter::repeat_with(|| prng.gen_range(-bound..bound))
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_generate_uniform_vector() {
        let mut prng = ChaCha20Rng::from_seed([0_u8; 32]);
        let v = generate_uniform_vector(&mut prng, 1000, 2.5);
        assert_eq!(v.len(), 1000);
        assert!(v.iter().all(|x| (-2.5..2.5).contains(x)));

        let mut same = ChaCha20Rng::from_seed([0_u8; 32]);
        assert_eq!(v, generate_uniform_vector(&mut same, 1000, 2.5));
    }

    #[test]
    fn test_generate_uniform_vector_zero_bound() {
        let mut prng = ChaCha20Rng::from_seed([1_u8; 32]);
        assert_eq!(generate_uniform_vector(&mut prng, 3, 0.), vec![0.; 3]);
    }
}

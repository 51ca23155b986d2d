//! Mask seed and mask generation.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use derive_more::{AsMut, AsRef};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sodiumoxide::crypto::box_;

use crate::{
    crypto::{prng::generate_uniform_vector, ByteObject},
    mask::masking::Mask,
};

/// The absolute bound of the mask elements.
pub const MASK_BOUND: f64 = 100.;

#[derive(AsRef, AsMut, Clone, Debug, PartialEq, Eq)]
/// A seed to generate a mask.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct MaskSeed(box_::Seed);

impl ByteObject for MaskSeed {
    const LENGTH: usize = box_::SEEDBYTES;

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::Seed::from_slice(bytes).map(Self)
    }

    fn zeroed() -> Self {
        Self(box_::Seed([0_u8; Self::LENGTH]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl MaskSeed {
    /// Gets this seed as an array.
    pub fn as_array(&self) -> [u8; Self::LENGTH] {
        (self.0).0
    }

    /// Derives a mask of given length from this seed.
    ///
    /// The mask elements are uniformly distributed in `[-MASK_BOUND, MASK_BOUND)`.
    pub fn derive_mask(&self, len: usize) -> Mask {
        let mut prng = ChaCha20Rng::from_seed(self.as_array());
        generate_uniform_vector(&mut prng, len, MASK_BOUND).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_mask() {
        let seed = MaskSeed::generate();
        let mask = seed.derive_mask(10);
        assert_eq!(mask.len(), 10);
        assert!(mask.as_slice().iter().all(|m| m.abs() <= MASK_BOUND));
        assert_eq!(mask, seed.derive_mask(10));
        assert_ne!(mask, MaskSeed::generate().derive_mask(10));
    }
}

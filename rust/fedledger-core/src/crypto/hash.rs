//! Wrappers around some of the [sodiumoxide] hashing primitives.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/
//! [crypto module]: crate::crypto

use derive_more::{AsMut, AsRef, From};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::hash::sha256;

use super::ByteObject;

#[derive(
    AsRef,
    AsMut,
    From,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    Ord,
    PartialEq,
    Copy,
    Clone,
    PartialOrd,
    Debug,
)]
/// A digest of the `SHA256` hash function.
pub struct Sha256(sha256::Digest);

impl ByteObject for Sha256 {
    const LENGTH: usize = sha256::DIGESTBYTES;

    fn zeroed() -> Self {
        Self(sha256::Digest([0_u8; sha256::DIGESTBYTES]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        sha256::Digest::from_slice(bytes).map(Self)
    }
}

impl Sha256 {
    /// Computes the digest of the message `m`.
    pub fn hash(m: &[u8]) -> Self {
        Self(sha256::hash(m))
    }
}

/// Computes the content address of a model: the hex encoded `SHA256` digest of its weights
/// serialized as little-endian `f64`s.
pub fn model_hash(weights: &[f64]) -> String {
    let bytes: Vec<u8> = weights.iter().flat_map(|w| w.to_le_bytes()).collect();
    Sha256::hash(&bytes).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_digest() {
        assert_eq!(
            Sha256::hash(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = Sha256::hash(b"ledger");
        assert_eq!(Sha256::from_hex(&digest.to_hex()), Some(digest));
        assert!(Sha256::from_hex("abcd").is_none());
        assert!(Sha256::from_hex("not hex").is_none());
    }

    #[test]
    fn test_model_hash_is_sensitive_to_every_weight() {
        let a = model_hash(&[1.0, 2.0, 3.0]);
        let b = model_hash(&[1.0, 2.0, 3.000_000_1]);
        assert_ne!(a, b);
        assert_eq!(a, model_hash(&[1.0, 2.0, 3.0]));
    }
}

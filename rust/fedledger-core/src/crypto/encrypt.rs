//! Additively homomorphic encryption of model vectors.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! Weights are embedded into the ring `Z/2^64` as signed fixed-point numbers with
//! [`FRACTIONAL_BITS`] fractional bits. [`PadEncryption`] then adds a `ChaCha20` key stream
//! which is derived from a secret [`PadKey`] and a fresh nonce per ciphertext. Adding two
//! ciphertexts adds the embedded weights and collects the nonces, and decryption strips the key
//! streams of all collected nonces at once. Nobody without the key learns anything about the
//! individual summands.
//!
//! [crypto module]: crate::crypto

use derive_more::{AsMut, AsRef};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sodiumoxide::randombytes::randombytes;
use thiserror::Error;

use super::{hash::Sha256, ByteObject};

/// Number of fractional bits of the fixed-point embedding.
pub const FRACTIONAL_BITS: i32 = 24;

#[derive(Debug, Error, Eq, PartialEq)]
/// Errors related to the homomorphic encryption capability.
pub enum EncryptionError {
    #[error("the value {0} cannot be represented in the fixed-point embedding")]
    Unrepresentable(String),

    #[error("ciphertexts of length {0} and {1} cannot be added")]
    LengthMismatch(usize, usize),

    #[error("ciphertexts of different schemes cannot be combined")]
    SchemeMismatch,

    #[error("unsupported key size of {0} bits")]
    InvalidKeySize(usize),
}

/// The scheme that produced a [`Ciphertext`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CipherScheme {
    Pad,
    Encoding,
}

/// An encrypted vector.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ciphertext {
    scheme: CipherScheme,
    data: Vec<u64>,
    nonces: Vec<u64>,
}

impl Ciphertext {
    /// Gets the number of encrypted elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Checks whether the ciphertext encrypts an empty vector.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Gets the number of plaintexts summed up in this ciphertext.
    pub fn summands(&self) -> usize {
        self.nonces.len().max(1)
    }

    fn combine(&self, other: &Self) -> Result<Self, EncryptionError> {
        if self.scheme != other.scheme {
            return Err(EncryptionError::SchemeMismatch);
        }
        if self.data.len() != other.data.len() {
            return Err(EncryptionError::LengthMismatch(
                self.data.len(),
                other.data.len(),
            ));
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a.wrapping_add(*b))
            .collect();
        let nonces = self.nonces.iter().chain(&other.nonces).copied().collect();
        Ok(Self {
            scheme: self.scheme,
            data,
            nonces,
        })
    }
}

/// An encrypt/decrypt/add capability over numeric vectors.
pub trait HomomorphicEncryption: Send + Sync {
    /// Encrypts a plaintext vector.
    ///
    /// # Errors
    /// Fails if a value is not finite or too large for the fixed-point embedding.
    fn encrypt(&self, plaintext: &[f64]) -> Result<Ciphertext, EncryptionError>;

    /// Decrypts a (possibly summed) ciphertext.
    ///
    /// # Errors
    /// Fails if the ciphertext was produced by another scheme.
    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<f64>, EncryptionError>;

    /// Adds two ciphertexts such that the result decrypts to the sum of both plaintexts.
    ///
    /// # Errors
    /// Fails if the ciphertexts have different lengths or stem from different schemes.
    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EncryptionError>;
}

fn encode(value: f64) -> Result<u64, EncryptionError> {
    let scaled = value * 2_f64.powi(FRACTIONAL_BITS);
    if !scaled.is_finite() || scaled.abs() >= i64::MAX as f64 {
        return Err(EncryptionError::Unrepresentable(value.to_string()));
    }
    Ok(scaled.round() as i64 as u64)
}

fn decode(value: u64) -> f64 {
    value as i64 as f64 / 2_f64.powi(FRACTIONAL_BITS)
}

#[derive(AsRef, AsMut, Clone, Debug, PartialEq, Eq)]
/// A secret key for the [`PadEncryption`] scheme.
pub struct PadKey([u8; 32]);

impl ByteObject for PadKey {
    const LENGTH: usize = 32;

    fn zeroed() -> Self {
        Self([0_u8; Self::LENGTH])
    }

    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        let mut key = [0_u8; Self::LENGTH];
        if bytes.len() != Self::LENGTH {
            return None;
        }
        key.copy_from_slice(bytes);
        Some(Self(key))
    }
}

impl PadKey {
    /// Generates a key from `key_size` bits of system entropy.
    ///
    /// # Errors
    /// Fails unless `key_size` is `128` or `256`.
    pub fn with_key_size(key_size: usize) -> Result<Self, EncryptionError> {
        match key_size {
            128 | 256 => {
                let entropy = randombytes(key_size / 8);
                Ok(Self::from_slice_unchecked(Sha256::hash(&entropy).as_slice()))
            }
            _ => Err(EncryptionError::InvalidKeySize(key_size)),
        }
    }

    fn key_stream(&self, nonce: u64, len: usize) -> impl Iterator<Item = u64> {
        let mut material = self.0.to_vec();
        material.extend_from_slice(&nonce.to_le_bytes());
        let mut seed = [0_u8; 32];
        seed.copy_from_slice(Sha256::hash(&material).as_slice());
        let mut prng = ChaCha20Rng::from_seed(seed);
        (0..len).map(move |_| prng.next_u64())
    }
}

/// The production binding of the [`HomomorphicEncryption`] capability.
#[derive(Clone, Debug)]
pub struct PadEncryption {
    key: PadKey,
}

impl PadEncryption {
    /// Creates the scheme for the given secret key.
    pub fn new(key: PadKey) -> Self {
        Self { key }
    }

    /// Creates the scheme with a fresh key of `key_size` bits.
    ///
    /// # Errors
    /// Fails for unsupported key sizes.
    pub fn with_key_size(key_size: usize) -> Result<Self, EncryptionError> {
        PadKey::with_key_size(key_size).map(Self::new)
    }
}

impl HomomorphicEncryption for PadEncryption {
    fn encrypt(&self, plaintext: &[f64]) -> Result<Ciphertext, EncryptionError> {
        let nonce = rand::random::<u64>();
        let data = plaintext
            .iter()
            .zip(self.key.key_stream(nonce, plaintext.len()))
            .map(|(value, pad)| encode(*value).map(|v| v.wrapping_add(pad)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Ciphertext {
            scheme: CipherScheme::Pad,
            data,
            nonces: vec![nonce],
        })
    }

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<f64>, EncryptionError> {
        if ciphertext.scheme != CipherScheme::Pad {
            return Err(EncryptionError::SchemeMismatch);
        }
        let mut data = ciphertext.data.clone();
        let len = data.len();
        for nonce in &ciphertext.nonces {
            for (value, pad) in data.iter_mut().zip(self.key.key_stream(*nonce, len)) {
                *value = value.wrapping_sub(pad);
            }
        }
        Ok(data.into_iter().map(decode).collect())
    }

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EncryptionError> {
        a.combine(b)
    }
}

#[cfg(any(test, feature = "testutils"))]
/// A reversible encoding without any secrecy. Only meant for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncodingScheme;

#[cfg(any(test, feature = "testutils"))]
impl HomomorphicEncryption for EncodingScheme {
    fn encrypt(&self, plaintext: &[f64]) -> Result<Ciphertext, EncryptionError> {
        let data = plaintext
            .iter()
            .map(|value| encode(*value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Ciphertext {
            scheme: CipherScheme::Encoding,
            data,
            nonces: Vec::new(),
        })
    }

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<f64>, EncryptionError> {
        if ciphertext.scheme != CipherScheme::Encoding {
            return Err(EncryptionError::SchemeMismatch);
        }
        Ok(ciphertext.data.iter().copied().map(decode).collect())
    }

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EncryptionError> {
        a.combine(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-6, "{} != {}", x, y);
        }
    }

    #[test]
    fn test_pad_encryption_hides_and_recovers() {
        let scheme = PadEncryption::with_key_size(256).unwrap();
        let plaintext = vec![0.25, -1.5, 3.0];
        let ciphertext = scheme.encrypt(&plaintext).unwrap();
        assert_ne!(ciphertext.data, EncodingScheme.encrypt(&plaintext).unwrap().data);
        assert_close(&scheme.decrypt(&ciphertext).unwrap(), &plaintext);
    }

    #[test]
    fn test_pad_encryption_is_additively_homomorphic() {
        let scheme = PadEncryption::with_key_size(128).unwrap();
        let a = scheme.encrypt(&[1.0, 2.0, -3.0]).unwrap();
        let b = scheme.encrypt(&[0.5, -4.0, 1.25]).unwrap();
        let c = scheme.encrypt(&[0.0, 0.5, 0.5]).unwrap();
        let sum = scheme.add(&scheme.add(&a, &b).unwrap(), &c).unwrap();
        assert_eq!(sum.summands(), 3);
        assert_close(&scheme.decrypt(&sum).unwrap(), &[1.5, -1.5, -1.25]);
    }

    #[test]
    fn test_pad_encryption_rejects_foreign_key() {
        let scheme = PadEncryption::with_key_size(256).unwrap();
        let other = PadEncryption::with_key_size(256).unwrap();
        let ciphertext = scheme.encrypt(&[1.0]).unwrap();
        let decrypted = other.decrypt(&ciphertext).unwrap();
        assert!((decrypted[0] - 1.0).abs() > 1e-6);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(
            PadEncryption::with_key_size(2048).unwrap_err(),
            EncryptionError::InvalidKeySize(2048),
        );
        let scheme = PadEncryption::with_key_size(256).unwrap();
        assert!(matches!(
            scheme.encrypt(&[f64::NAN]),
            Err(EncryptionError::Unrepresentable(_)),
        ));
        let a = scheme.encrypt(&[1.0]).unwrap();
        let b = scheme.encrypt(&[1.0, 2.0]).unwrap();
        assert_eq!(scheme.add(&a, &b), Err(EncryptionError::LengthMismatch(1, 2)));
        let encoded = EncodingScheme.encrypt(&[1.0]).unwrap();
        assert_eq!(scheme.add(&a, &encoded), Err(EncryptionError::SchemeMismatch));
        assert_eq!(scheme.decrypt(&encoded), Err(EncryptionError::SchemeMismatch));
    }

    #[test]
    fn test_encoding_scheme_roundtrip() {
        let a = EncodingScheme.encrypt(&[1.0, -2.0]).unwrap();
        let b = EncodingScheme.encrypt(&[0.5, 0.5]).unwrap();
        let sum = EncodingScheme.add(&a, &b).unwrap();
        assert_close(&EncodingScheme.decrypt(&sum).unwrap(), &[1.5, -1.5]);
    }
}

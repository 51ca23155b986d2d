//! Wrappers around the [sodiumoxide] primitives used by the federation.
//!
//! The wrappers provide methods defined on structs instead of the sodiumoxide functions. This is
//! done for the `Ed25519` signature key pairs which identify organizations and sign ledger blocks,
//! and for the `SHA256` hash function which content-addresses models and chains the ledger.
//! Additionally, the additively homomorphic [`HomomorphicEncryption`] capability lives here.
//!
//! # Examples
//! ## Hashing of models
//! ```
//! # use fedledger_core::crypto::model_hash;
//! let hash = model_hash(&[0.5, -1.0, 2.0]);
//! assert_eq!(hash.len(), 64);
//! assert_eq!(hash, model_hash(&[0.5, -1.0, 2.0]));
//! ```
//!
//! ## Signing of messages
//! ```
//! # use fedledger_core::crypto::SigningKeyPair;
//! let keys = SigningKeyPair::generate();
//! let message = b"Hello world!".to_vec();
//! let signature = keys.secret.sign_detached(&message);
//! assert!(keys.public.verify_detached(&signature, &message));
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

pub(crate) mod encrypt;
pub(crate) mod hash;
pub(crate) mod prng;
pub(crate) mod sign;

use sodiumoxide::randombytes::randombytes;

#[cfg(any(test, feature = "testutils"))]
pub use self::encrypt::EncodingScheme;
pub use self::{
    encrypt::{Ciphertext, EncryptionError, HomomorphicEncryption, PadEncryption, PadKey},
    hash::{model_hash, Sha256},
    prng::generate_uniform_vector,
    sign::{PublicSigningKey, SecretSigningKey, Signature, SigningKeyPair, SigningKeySeed},
};

/// An interface for slicing into cryptographic byte objects.
pub trait ByteObject: Sized {
    /// Length in bytes of this object
    const LENGTH: usize;

    /// Creates a new object with all the bytes initialized to `0`.
    fn zeroed() -> Self;

    /// Gets the object byte representation.
    fn as_slice(&self) -> &[u8];

    /// Creates an object from the given buffer.
    ///
    /// # Errors
    /// Returns `None` if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    /// Creates an object from the given buffer.
    ///
    /// # Panics
    /// Panics if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice_unchecked(bytes: &[u8]) -> Self {
        Self::from_slice(bytes).unwrap()
    }

    /// Generates an object with random bytes
    fn generate() -> Self {
        // safe unwrap: length of slice is guaranteed by constants
        Self::from_slice_unchecked(randombytes(Self::LENGTH).as_slice())
    }

    /// A helper for instantiating an object filled with the given value
    fn fill_with(value: u8) -> Self {
        Self::from_slice_unchecked(&vec![value; Self::LENGTH])
    }

    /// Encodes the object as a lowercase hex string.
    fn to_hex(&self) -> String {
        hex::encode(self.as_slice())
    }

    /// Decodes an object from a hex string.
    ///
    /// # Errors
    /// Returns `None` if the string is not valid hex or has the wrong length.
    fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s)
            .ok()
            .and_then(|bytes| Self::from_slice(&bytes))
    }
}

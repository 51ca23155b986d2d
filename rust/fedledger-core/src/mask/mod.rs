//! Secure aggregation of model updates via pairwise masking.
//!
//! # Masks
//! Every pair of organizations taking part in a [`MaskingSession`] shares a [`MaskSeed`], from
//! which a pseudo-random vector is derived via the `ChaCha20` stream cipher. The mask of an
//! organization combines the vectors of all the pairs it is part of, with opposite signs for the
//! two members of a pair. Therefore the masks of all participants sum up to zero and the
//! coordinator learns nothing but the sum of the updates.
//!
//! ```
//! # use std::collections::BTreeMap;
//! # use fedledger_core::mask::{aggregate_masked, apply_mask, MaskingSession};
//! let mut session = MaskingSession::new(vec!["org-a".to_string(), "org-b".to_string()]);
//! let mut masked = BTreeMap::new();
//! for (org, update) in &[("org-a", vec![1.0, 2.0]), ("org-b", vec![3.0, 4.0])] {
//!     let mask = session.generate_mask(org, 2).unwrap();
//!     masked.insert(org.to_string(), apply_mask(update, &mask).unwrap());
//! }
//! let sum = aggregate_masked(&masked, &BTreeMap::new()).unwrap();
//! assert!((sum[0] - 4.0).abs() < 1e-9 && (sum[1] - 6.0).abs() < 1e-9);
//! ```
//!
//! # Dropouts
//! If an organization drops out after the masks were handed out, the masks of the remaining
//! organizations don't cancel out anymore. The surviving organizations then reveal the terms they
//! share with the dropout via [`MaskingSession::reveal_dropout()`], which are added back during
//! the aggregation in [`aggregate_masked()`].

pub(crate) mod masking;
pub(crate) mod seed;

pub use self::{
    masking::{aggregate_masked, apply_mask, remove_mask, Mask, MaskingError, MaskingSession},
    seed::{MaskSeed, MASK_BOUND},
};

//! Masking, aggregation and dropout recovery of model updates.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::collections::{BTreeMap, BTreeSet};

use derive_more::{From, Into};
use thiserror::Error;

use crate::{crypto::ByteObject, mask::seed::MaskSeed, OrganizationId};

#[derive(Debug, Error, Eq, PartialEq)]
/// Errors related to the masking and the aggregation of masked updates.
pub enum MaskingError {
    #[error("organization {0} does not take part in the masking session")]
    UnknownParticipant(OrganizationId),

    #[error("no mask has been generated for any survivor of the dropout of {0}")]
    MaskNotGenerated(OrganizationId),

    #[error("organization {0} submitted a masked update but is also reported as dropped out")]
    DropoutSubmitted(OrganizationId),

    #[error("vectors of length {expected} and {actual} cannot be combined")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("there are no masked updates to aggregate")]
    EmptyInput,
}

#[derive(Clone, Debug, PartialEq, From, Into)]
/// A mask that hides a model update.
pub struct Mask(Vec<f64>);

impl Mask {
    /// Gets the number of mask elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the mask is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gets the mask elements.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    fn zeroed(len: usize) -> Self {
        Self(vec![0_f64; len])
    }

    fn add_assign(&mut self, other: &[f64], sign: f64) {
        for (m, o) in self.0.iter_mut().zip(other) {
            *m += sign * o;
        }
    }
}

fn check_len(expected: usize, actual: usize) -> Result<(), MaskingError> {
    if expected == actual {
        Ok(())
    } else {
        Err(MaskingError::DimensionMismatch { expected, actual })
    }
}

/// Masks an update: `update - mask`.
///
/// # Errors
/// Fails if the lengths of the update and the mask differ.
pub fn apply_mask(update: &[f64], mask: &Mask) -> Result<Vec<f64>, MaskingError> {
    check_len(update.len(), mask.len())?;
    Ok(update.iter().zip(mask.as_slice()).map(|(u, m)| u - m).collect())
}

/// Unmasks a masked update: `masked + mask`.
///
/// # Errors
/// Fails if the lengths of the masked update and the mask differ.
pub fn remove_mask(masked: &[f64], mask: &Mask) -> Result<Vec<f64>, MaskingError> {
    check_len(masked.len(), mask.len())?;
    Ok(masked.iter().zip(mask.as_slice()).map(|(u, m)| u + m).collect())
}

/// Aggregates masked updates into the sum of the underlying true updates.
///
/// All `masked` updates are summed up. The pairwise masks of the submitting organizations cancel
/// each other out, except for the terms they share with organizations which dropped out. Those
/// dangling terms are exactly the `revealed` masks of the dropouts, which are added back.
///
/// # Errors
/// Fails if there are no masked updates, if the vectors have different lengths or if a dropout
/// is also among the submitters.
pub fn aggregate_masked(
    masked: &BTreeMap<OrganizationId, Vec<f64>>,
    revealed: &BTreeMap<OrganizationId, Mask>,
) -> Result<Vec<f64>, MaskingError> {
    let len = masked
        .values()
        .next()
        .map(Vec::len)
        .ok_or(MaskingError::EmptyInput)?;

    let mut sum = Mask::zeroed(len);
    for update in masked.values() {
        check_len(len, update.len())?;
        sum.add_assign(update, 1.);
    }
    for (dropout, mask) in revealed {
        if masked.contains_key(dropout) {
            return Err(MaskingError::DropoutSubmitted(dropout.clone()));
        }
        check_len(len, mask.len())?;
        sum.add_assign(mask.as_slice(), 1.);
    }
    Ok(sum.into())
}

/// A secure aggregation session over a fixed set of organizations.
///
/// Every unordered pair of organizations shares a [`MaskSeed`]. The mask of an organization is
/// the sum of the vectors derived from the seeds it shares with its peers, added for peers which
/// order after it and subtracted for peers which order before it. Hence the masks of all
/// organizations sum up to zero.
#[derive(Debug)]
pub struct MaskingSession {
    participants: BTreeSet<OrganizationId>,
    pair_seeds: BTreeMap<(OrganizationId, OrganizationId), MaskSeed>,
    masks: BTreeMap<OrganizationId, Mask>,
}

impl MaskingSession {
    /// Sets up a session with a fresh seed for every pair of `participants`.
    pub fn new<I>(participants: I) -> Self
    where
        I: IntoIterator<Item = OrganizationId>,
    {
        let participants: BTreeSet<OrganizationId> = participants.into_iter().collect();
        let mut pair_seeds = BTreeMap::new();
        for (i, low) in participants.iter().enumerate() {
            for high in participants.iter().skip(i + 1) {
                pair_seeds.insert((low.clone(), high.clone()), MaskSeed::generate());
            }
        }
        Self {
            participants,
            pair_seeds,
            masks: BTreeMap::new(),
        }
    }

    /// Gets the participants of the session.
    pub fn participants(&self) -> impl Iterator<Item = &OrganizationId> {
        self.participants.iter()
    }

    fn ensure_participant(&self, org: &str) -> Result<(), MaskingError> {
        if self.participants.contains(org) {
            Ok(())
        } else {
            Err(MaskingError::UnknownParticipant(org.to_string()))
        }
    }

    /// The term which `org` contributes to its mask for the pair it forms with `peer`.
    fn pair_term(&self, org: &str, peer: &str, len: usize) -> Option<(Mask, f64)> {
        let (key, sign) = if org < peer {
            ((org.to_string(), peer.to_string()), 1.)
        } else {
            ((peer.to_string(), org.to_string()), -1.)
        };
        self.pair_seeds
            .get(&key)
            .map(|seed| (seed.derive_mask(len), sign))
    }

    /// Generates the mask of `org` for an update of length `len` and records it.
    ///
    /// # Errors
    /// Fails if `org` does not take part in the session.
    pub fn generate_mask(&mut self, org: &str, len: usize) -> Result<Mask, MaskingError> {
        self.ensure_participant(org)?;
        let mut mask = Mask::zeroed(len);
        for peer in self.participants.iter().filter(|peer| peer.as_str() != org) {
            if let Some((term, sign)) = self.pair_term(org, peer, len) {
                mask.add_assign(term.as_slice(), sign);
            }
        }
        self.masks.insert(org.to_string(), mask.clone());
        Ok(mask)
    }

    /// Gets the recorded mask of `org`.
    pub fn mask(&self, org: &str) -> Option<&Mask> {
        self.masks.get(org)
    }

    /// Reveals the mask terms which the `survivors` share with the dropped out organization.
    ///
    /// Each survivor only discloses the seed it shares with `dropout`, so the revealed mask never
    /// exposes any survivor's own update.
    ///
    /// # Errors
    /// Fails if any of the organizations is not part of the session or if no survivor has
    /// generated a mask yet.
    pub fn reveal_dropout<'a, I>(&self, dropout: &str, survivors: I) -> Result<Mask, MaskingError>
    where
        I: IntoIterator<Item = &'a OrganizationId>,
    {
        self.ensure_participant(dropout)?;
        let survivors = survivors.into_iter().collect::<Vec<_>>();
        for survivor in &survivors {
            self.ensure_participant(survivor)?;
        }
        let len = survivors
            .iter()
            .find_map(|survivor| self.masks.get(survivor.as_str()))
            .map(Mask::len)
            .ok_or_else(|| MaskingError::MaskNotGenerated(dropout.to_string()))?;

        let mut revealed = Mask::zeroed(len);
        for survivor in survivors.into_iter().filter(|s| s.as_str() != dropout) {
            if let Some((term, sign)) = self.pair_term(survivor, dropout, len) {
                revealed.add_assign(term.as_slice(), sign);
            }
        }
        Ok(revealed)
    }
}

#![cfg_attr(docsrs, feature(doc_cfg))]
//! # FedLedger: cross-organization federated learning with verifiable provenance
//!
//! Independent organizations jointly train a shared model without exposing their raw data or
//! their unprotected gradients. Every completed training round is anchored on a hash-chained,
//! multi-signed ledger, so that no party has to trust the unverified claims of a central
//! aggregator about what happened.
//!
//! This crate contains the synchronous building blocks of the federation:
//!
//! - [`crypto`]: `SHA256` content addressing of models, `Ed25519` signatures of organizations
//!   and an additively homomorphic encryption capability.
//! - [`privacy`]: differential privacy noise, the cumulative privacy budget and gradient
//!   sanitization.
//! - [`mask`]: secure aggregation via pairwise-cancelling masks which tolerates dropouts.
//! - [`aggregation`]: federated averaging, its proximal variant and the Byzantine-robust
//!   median, trimmed mean and Krum reducers.
//!
//! The round lifecycle, the ledger and the orchestration of a federation live in the
//! `fedledger-server` crate.

pub mod aggregation;
pub mod common;
pub mod crypto;
pub mod mask;
pub mod privacy;

use thiserror::Error;

#[derive(Error, Debug)]
#[error("initialization failed: insufficient system entropy to generate secrets")]
/// An error related to insufficient system entropy for secrets at program startup.
pub struct InitError;

/// Initializes the cryptographic primitives.
///
/// Must be called once before any keys, seeds or pads are generated from multiple threads.
///
/// # Errors
/// Fails if the system doesn't provide enough entropy.
pub fn init() -> Result<(), InitError> {
    sodiumoxide::init().map_err(|_| InitError)
}

/// The identifier of an organization taking part in the federation.
pub type OrganizationId = String;

//! Blocks of the ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fedledger_core::{
    common::PrivacyParameters,
    crypto::{ByteObject, PublicSigningKey, Sha256, Signature},
    OrganizationId,
};

use crate::ledger::{
    storage::{BlockRow, ProvenanceRow},
    LedgerError,
};

/// The previous block hash of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// The aggregation method recorded in the genesis block.
pub const GENESIS_METHOD: &str = "genesis";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The provenance of the model anchored in a block.
pub struct Provenance {
    /// The round which produced the model. The genesis model stems from round `0`.
    pub round: u64,
    pub model_version: u64,
    /// The hash of the model the round started from.
    pub parent_model_hash: Option<String>,
    pub participants: Vec<OrganizationId>,
    /// The differential privacy parameters, if noise was added.
    pub privacy: Option<PrivacyParameters>,
    /// The aggregation quality score.
    pub quality: Option<f64>,
}

/// The hashed part of a block. The field order is part of the chain format.
#[derive(Serialize)]
struct BlockHeader<'a> {
    height: u64,
    timestamp: &'a DateTime<Utc>,
    previous_block_hash: &'a str,
    model_hash: &'a str,
    aggregation_method: &'a str,
    num_clients: usize,
    provenance: &'a Provenance,
    org_signatures: &'a BTreeMap<OrganizationId, Signature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A finalized block of the ledger.
pub struct Block {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub previous_block_hash: String,
    pub model_hash: String,
    pub aggregation_method: String,
    pub num_clients: usize,
    pub provenance: Provenance,
    pub org_signatures: BTreeMap<OrganizationId, Signature>,
    /// The hex encoded `SHA256` digest of all other fields.
    pub block_hash: String,
}

impl Block {
    /// Creates a block and computes its hash.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn finalize(
        height: u64,
        timestamp: DateTime<Utc>,
        previous_block_hash: String,
        model_hash: String,
        aggregation_method: String,
        num_clients: usize,
        provenance: Provenance,
        org_signatures: BTreeMap<OrganizationId, Signature>,
    ) -> Result<Self, LedgerError> {
        let mut block = Self {
            height,
            timestamp,
            previous_block_hash,
            model_hash,
            aggregation_method,
            num_clients,
            provenance,
            org_signatures,
            block_hash: String::new(),
        };
        block.block_hash = block.compute_hash()?;
        Ok(block)
    }

    /// Computes the hash of the block from all fields but the stored hash.
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let header = BlockHeader {
            height: self.height,
            timestamp: &self.timestamp,
            previous_block_hash: &self.previous_block_hash,
            model_hash: &self.model_hash,
            aggregation_method: &self.aggregation_method,
            num_clients: self.num_clients,
            provenance: &self.provenance,
            org_signatures: &self.org_signatures,
        };
        let bytes = serde_json::to_vec(&header)?;
        Ok(Sha256::hash(&bytes).to_hex())
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub(crate) fn to_row(&self) -> Result<BlockRow, LedgerError> {
        Ok(BlockRow {
            height: self.height,
            timestamp: self.timestamp,
            previous_block_hash: self.previous_block_hash.clone(),
            model_hash: self.model_hash.clone(),
            aggregation_method: self.aggregation_method.clone(),
            num_clients: self.num_clients,
            block_hash: self.block_hash.clone(),
            provenance: serde_json::to_string(&self.provenance)?,
            signatures: serde_json::to_string(&self.org_signatures)?,
        })
    }

    pub(crate) fn from_row(row: BlockRow) -> Result<Self, LedgerError> {
        Ok(Self {
            height: row.height,
            timestamp: row.timestamp,
            previous_block_hash: row.previous_block_hash,
            model_hash: row.model_hash,
            aggregation_method: row.aggregation_method,
            num_clients: row.num_clients,
            provenance: serde_json::from_str(&row.provenance)?,
            org_signatures: serde_json::from_str(&row.signatures)?,
            block_hash: row.block_hash,
        })
    }

    pub(crate) fn provenance_row(&self) -> ProvenanceRow {
        ProvenanceRow {
            model_hash: self.model_hash.clone(),
            block_height: self.height,
            model_version: self.provenance.model_version,
            parent_model_hash: self.provenance.parent_model_hash.clone(),
        }
    }
}

/// The message organizations sign to approve the anchoring of a round.
pub fn anchor_message(round: u64, model_hash: &str) -> Vec<u8> {
    format!("{}:{}", round, model_hash).into_bytes()
}

/// Checks the signatures of organizations over a message.
///
/// # Errors
/// Fails with [`LedgerError::InvalidSignature`] if a signature doesn't verify or stems from an
/// unknown organization and with [`LedgerError::InsufficientSignatures`] if fewer than
/// `min_signatures` signatures are present.
pub fn check_signatures<F>(
    message: &[u8],
    signatures: &BTreeMap<OrganizationId, Signature>,
    min_signatures: usize,
    public_key: F,
) -> Result<(), LedgerError>
where
    F: Fn(&str) -> Option<PublicSigningKey>,
{
    for (org, signature) in signatures {
        let valid = public_key(org)
            .map(|key| key.verify_detached(signature, message))
            .unwrap_or(false);
        if !valid {
            return Err(LedgerError::InvalidSignature(org.clone()));
        }
    }
    if signatures.len() < min_signatures {
        return Err(LedgerError::InsufficientSignatures {
            have: signatures.len(),
            need: min_signatures,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use fedledger_core::crypto::SigningKeyPair;

    use super::*;

    fn block() -> Block {
        Block::finalize(
            1,
            Utc::now(),
            GENESIS_PREVIOUS_HASH.to_string(),
            "efgh".repeat(8),
            "fedavg".into(),
            2,
            Provenance {
                round: 1,
                model_version: 1,
                parent_model_hash: Some("abcd".repeat(8)),
                participants: vec!["org-a".into(), "org-b".into()],
                privacy: Some(PrivacyParameters {
                    epsilon: 1.,
                    delta: 1e-5,
                }),
                quality: Some(1.),
            },
            BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_hash_covers_every_field() {
        let block = block();
        assert_eq!(block.block_hash.len(), 64);
        assert_eq!(block.compute_hash().unwrap(), block.block_hash);

        let mut tampered = block.clone();
        tampered.num_clients = 3;
        assert_ne!(tampered.compute_hash().unwrap(), block.block_hash);

        let mut tampered = block.clone();
        tampered.provenance.participants.pop();
        assert_ne!(tampered.compute_hash().unwrap(), block.block_hash);

        let mut tampered = block.clone();
        tampered.timestamp = tampered.timestamp + chrono::Duration::seconds(1);
        assert_ne!(tampered.compute_hash().unwrap(), block.block_hash);

        // the stored hash is not part of the hashed header
        let mut rehashed = block.clone();
        rehashed.block_hash = String::new();
        assert_eq!(rehashed.compute_hash().unwrap(), block.block_hash);
    }

    #[test]
    fn test_row_keeps_the_hash_valid() {
        let block = block();
        let restored = Block::from_row(block.to_row().unwrap()).unwrap();
        assert_eq!(restored.compute_hash().unwrap(), block.block_hash);
        assert_eq!(restored, block);
    }

    #[test]
    fn test_check_signatures() {
        let keys = SigningKeyPair::generate();
        let message = anchor_message(1, "model");
        let mut signatures = BTreeMap::new();
        signatures.insert("org-a".to_string(), keys.secret.sign_detached(&message));
        let lookup = |org: &str| {
            if org == "org-a" {
                Some(keys.public)
            } else {
                None
            }
        };

        assert!(check_signatures(&message, &signatures, 1, lookup).is_ok());
        assert!(matches!(
            check_signatures(&message, &signatures, 2, lookup),
            Err(LedgerError::InsufficientSignatures { have: 1, need: 2 }),
        ));
        assert!(matches!(
            check_signatures(&anchor_message(2, "model"), &signatures, 1, lookup),
            Err(LedgerError::InvalidSignature(org)) if org == "org-a",
        ));

        signatures.insert("org-x".to_string(), keys.secret.sign_detached(&message));
        assert!(matches!(
            check_signatures(&message, &signatures, 1, lookup),
            Err(LedgerError::InvalidSignature(org)) if org == "org-x",
        ));
    }
}

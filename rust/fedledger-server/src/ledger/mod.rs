//! The append-only, hash-chained ledger.
//!
//! Every block references the hash of its predecessor and carries the provenance of the model it
//! anchors together with the signatures of the organizations which approved it. The ledger never
//! mutates a block after it has been finalized, so any later modification of the stored rows is
//! detected by [`Ledger::verify_chain`]. Once corruption has been detected, the ledger halts and
//! refuses to append further blocks until an operator calls [`Ledger::resume`].

pub mod block;
pub mod storage;

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use fedledger_core::{crypto::Signature, OrganizationId};

pub use self::{
    block::{
        anchor_message,
        check_signatures,
        Block,
        Provenance,
        GENESIS_METHOD,
        GENESIS_PREVIOUS_HASH,
    },
    storage::{LedgerStorage, StorageError},
};

/// Errors of the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("the ledger has no genesis block")]
    NoGenesisBlock,
    #[error("the ledger already has a genesis block")]
    GenesisExists,
    #[error("no block at height {0}")]
    BlockNotFound(u64),
    #[error("the hash of block {height} doesn't match its content")]
    HashMismatch { height: u64 },
    #[error("block {height} doesn't reference its predecessor")]
    ChainDiscontinuity { height: u64 },
    #[error("model {0} is not anchored in the ledger")]
    UnknownModel(String),
    #[error("invalid signature of organization {0}")]
    InvalidSignature(OrganizationId),
    #[error("{have} signatures present but {need} are required")]
    InsufficientSignatures { have: usize, need: usize },
    #[error("provenance check failed: {0}")]
    ProvenanceCheckFailed(String),
    #[error("the ledger is halted since block {0} failed verification")]
    Halted(u64),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// Gets the height of the corrupt block, if the error reports one.
    pub fn corrupt_height(&self) -> Option<u64> {
        match self {
            LedgerError::HashMismatch { height } | LedgerError::ChainDiscontinuity { height } => {
                Some(*height)
            }
            _ => None,
        }
    }
}

/// The ledger on top of a store.
pub struct Ledger<S> {
    store: S,
    /// Serializes the assignment of heights and predecessors.
    append_lock: Mutex<()>,
    /// The height of the corrupt block which halted the ledger.
    halted: SyncMutex<Option<u64>>,
}

impl<S> Ledger<S>
where
    S: LedgerStorage,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            append_lock: Mutex::new(()),
            halted: SyncMutex::new(None),
        }
    }

    /// Gets a handle to the underlying store.
    pub fn store(&self) -> S {
        self.store.clone()
    }

    /// Creates the genesis block of the ledger.
    ///
    /// # Errors
    /// Fails if the ledger already has a genesis block.
    pub async fn create_genesis(
        &self,
        model_hash: impl Into<String>,
        model_version: u64,
        org: impl Into<OrganizationId>,
    ) -> Result<Block, LedgerError> {
        let _guard = self.append_lock.lock().await;
        self.check_halted()?;
        let mut store = self.store.clone();
        if store.block(0).await?.is_some() {
            return Err(LedgerError::GenesisExists);
        }

        let provenance = Provenance {
            round: 0,
            model_version,
            parent_model_hash: None,
            participants: vec![org.into()],
            privacy: None,
            quality: None,
        };
        let block = Block::finalize(
            0,
            Utc::now(),
            GENESIS_PREVIOUS_HASH.to_string(),
            model_hash.into(),
            GENESIS_METHOD.to_string(),
            1,
            provenance,
            BTreeMap::new(),
        )?;
        store
            .insert_block(&block.to_row()?, &block.provenance_row())
            .await?;
        info!(
            "created genesis block {} for model {}",
            block.block_hash, block.model_hash
        );
        Ok(block)
    }

    /// Appends a block for a completed round.
    ///
    /// The round number is recorded in the provenance. If the provenance names no parent model,
    /// the model of the latest block becomes the parent.
    ///
    /// # Errors
    /// Fails if the ledger is halted, has no genesis block, if the parent model is unknown or if
    /// the model is already anchored.
    pub async fn append(
        &self,
        round: u64,
        model_hash: impl Into<String>,
        aggregation_method: impl Into<String>,
        num_clients: usize,
        mut provenance: Provenance,
        org_signatures: BTreeMap<OrganizationId, Signature>,
    ) -> Result<Block, LedgerError> {
        let _guard = self.append_lock.lock().await;
        self.check_halted()?;
        let mut store = self.store.clone();
        let previous = store
            .latest_block()
            .await?
            .ok_or(LedgerError::NoGenesisBlock)?;

        provenance.round = round;
        let parent = provenance
            .parent_model_hash
            .get_or_insert_with(|| previous.model_hash.clone())
            .clone();
        if store.provenance(&parent).await?.is_none() {
            return Err(LedgerError::ProvenanceCheckFailed(format!(
                "parent model {} is not anchored",
                parent
            )));
        }

        let model_hash = model_hash.into();
        if let Some(anchored) = store.provenance(&model_hash).await? {
            return Err(LedgerError::ProvenanceCheckFailed(format!(
                "model {} is already anchored in block {}",
                model_hash, anchored.block_height
            )));
        }

        let block = Block::finalize(
            previous.height + 1,
            Utc::now(),
            previous.block_hash,
            model_hash,
            aggregation_method.into(),
            num_clients,
            provenance,
            org_signatures,
        )?;
        store
            .insert_block(&block.to_row()?, &block.provenance_row())
            .await?;
        info!(
            "appended block {} at height {} for round {}",
            block.block_hash, block.height, round
        );
        Ok(block)
    }

    /// Gets the block at a height.
    pub async fn block(&self, height: u64) -> Result<Block, LedgerError> {
        let row = self
            .store
            .clone()
            .block(height)
            .await?
            .ok_or(LedgerError::BlockNotFound(height))?;
        Block::from_row(row)
    }

    /// Gets all blocks in height order.
    pub async fn blocks(&self) -> Result<Vec<Block>, LedgerError> {
        self.store
            .clone()
            .blocks()
            .await?
            .into_iter()
            .map(Block::from_row)
            .collect()
    }

    /// Gets the block with the largest height, if any.
    pub async fn latest_block(&self) -> Result<Option<Block>, LedgerError> {
        self.store
            .clone()
            .latest_block()
            .await?
            .map(Block::from_row)
            .transpose()
    }

    /// Verifies the hash of a block and its link to the predecessor.
    ///
    /// # Errors
    /// Fails with [`LedgerError::HashMismatch`] if the stored hash doesn't match the content of
    /// the block and with [`LedgerError::ChainDiscontinuity`] if the block doesn't reference the
    /// stored hash of its predecessor.
    pub async fn verify_block(&self, height: u64) -> Result<(), LedgerError> {
        let mut store = self.store.clone();
        let row = store
            .block(height)
            .await?
            .ok_or(LedgerError::BlockNotFound(height))?;
        let predecessor_hash = if height == 0 {
            GENESIS_PREVIOUS_HASH.to_string()
        } else {
            store
                .block(height - 1)
                .await?
                .ok_or(LedgerError::ChainDiscontinuity { height })?
                .block_hash
        };
        verify_row(height, row, &predecessor_hash)
    }

    /// Verifies every block in height order and stops at the first failure.
    ///
    /// Returns the number of verified blocks. A failed verification halts the ledger.
    pub async fn verify_chain(&self) -> Result<usize, LedgerError> {
        let rows = self.store.clone().blocks().await?;
        let mut predecessor_hash = GENESIS_PREVIOUS_HASH.to_string();
        for (expected_height, row) in (0_u64..).zip(rows.iter()) {
            let result = if row.height != expected_height {
                Err(LedgerError::ChainDiscontinuity {
                    height: expected_height,
                })
            } else {
                verify_row(row.height, row.clone(), &predecessor_hash)
            };
            if let Err(err) = result {
                if let Some(height) = err.corrupt_height() {
                    error!("ledger verification failed: {}", err);
                    *self.halted.lock() = Some(height);
                }
                return Err(err);
            }
            predecessor_hash = row.block_hash.clone();
        }
        debug!("verified {} blocks", rows.len());
        Ok(rows.len())
    }

    /// Lifts a halt after an operator dealt with the corruption.
    pub fn resume(&self) {
        if let Some(height) = self.halted.lock().take() {
            warn!("ledger resumed after corruption at block {}", height);
        }
    }

    /// Gets the height of the block which halted the ledger.
    pub fn is_halted(&self) -> Option<u64> {
        *self.halted.lock()
    }

    /// Gets the blocks which led to a model, newest first.
    ///
    /// The traversal stops at a model without parent, at an unknown parent or at a model which
    /// was already visited.
    ///
    /// # Errors
    /// Fails if the model is not anchored in the ledger.
    pub async fn model_lineage(&self, model_hash: &str) -> Result<Vec<Block>, LedgerError> {
        let mut store = self.store.clone();
        let mut entry = store
            .provenance(model_hash)
            .await?
            .ok_or_else(|| LedgerError::UnknownModel(model_hash.to_string()))?;
        let mut visited = HashSet::new();
        let mut lineage = Vec::new();
        loop {
            visited.insert(entry.model_hash.clone());
            let row = store
                .block(entry.block_height)
                .await?
                .ok_or(LedgerError::BlockNotFound(entry.block_height))?;
            lineage.push(Block::from_row(row)?);

            let parent = match entry.parent_model_hash {
                Some(parent) if !visited.contains(&parent) => parent,
                Some(parent) => {
                    warn!("provenance cycle at model {}", parent);
                    break;
                }
                None => break,
            };
            entry = match store.provenance(&parent).await? {
                Some(entry) => entry,
                None => {
                    warn!("parent model {} is not anchored", parent);
                    break;
                }
            };
        }
        Ok(lineage)
    }

    fn check_halted(&self) -> Result<(), LedgerError> {
        match *self.halted.lock() {
            Some(height) => Err(LedgerError::Halted(height)),
            None => Ok(()),
        }
    }
}

fn verify_row(
    height: u64,
    row: storage::BlockRow,
    predecessor_hash: &str,
) -> Result<(), LedgerError> {
    let stored_hash = row.block_hash.clone();
    let block = Block::from_row(row).map_err(|_| LedgerError::HashMismatch { height })?;
    if block.height != height || block.compute_hash()? != stored_hash {
        return Err(LedgerError::HashMismatch { height });
    }
    if block.previous_block_hash != predecessor_hash {
        return Err(LedgerError::ChainDiscontinuity { height });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ledger::storage::MemoryStore;

    fn provenance(version: u64) -> Provenance {
        Provenance {
            round: 0,
            model_version: version,
            parent_model_hash: None,
            participants: vec!["org-a".into(), "org-b".into()],
            privacy: None,
            quality: Some(1.),
        }
    }

    async fn chain(len: u64) -> (Ledger<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        let ledger = Ledger::new(store.clone());
        ledger
            .create_genesis("model-0", 0, "coordinator")
            .await
            .unwrap();
        for round in 1..=len {
            ledger
                .append(
                    round,
                    format!("model-{}", round),
                    "fedavg",
                    2,
                    provenance(round),
                    BTreeMap::new(),
                )
                .await
                .unwrap();
        }
        (ledger, store)
    }

    #[tokio::test]
    async fn test_genesis_and_lineage() {
        let ledger = Ledger::new(MemoryStore::new());
        let genesis = ledger
            .create_genesis("abcd".repeat(8), 0, "org-a")
            .await
            .unwrap();
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.previous_block_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(genesis.block_hash, genesis.compute_hash().unwrap());
        assert!(matches!(
            ledger.create_genesis("abcd".repeat(8), 0, "org-a").await,
            Err(LedgerError::GenesisExists),
        ));

        let block = ledger
            .append(
                1,
                "efgh".repeat(8),
                "fedavg",
                2,
                provenance(1),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(block.previous_block_hash, genesis.block_hash);
        assert_eq!(block.provenance.round, 1);
        assert_eq!(
            block.provenance.parent_model_hash,
            Some("abcd".repeat(8))
        );

        let lineage = ledger.model_lineage(&"efgh".repeat(8)).await.unwrap();
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage[0].model_hash, "efgh".repeat(8));
        assert_eq!(lineage[1].model_hash, "abcd".repeat(8));
        assert_eq!(ledger.verify_chain().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_without_genesis() {
        let ledger = Ledger::new(MemoryStore::new());
        assert!(matches!(
            ledger
                .append(1, "model", "fedavg", 1, provenance(1), BTreeMap::new())
                .await,
            Err(LedgerError::NoGenesisBlock),
        ));
        assert_eq!(ledger.verify_chain().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_with_unknown_parent() {
        let (ledger, _) = chain(1).await;
        let mut orphan = provenance(2);
        orphan.parent_model_hash = Some("unknown".into());
        assert!(matches!(
            ledger
                .append(2, "model-2", "fedavg", 2, orphan, BTreeMap::new())
                .await,
            Err(LedgerError::ProvenanceCheckFailed(_)),
        ));
        assert_eq!(ledger.latest_block().await.unwrap().unwrap().height, 1);
    }

    #[tokio::test]
    async fn test_append_of_an_anchored_model() {
        let (ledger, _) = chain(2).await;
        assert!(matches!(
            ledger
                .append(3, "model-1", "fedavg", 2, provenance(3), BTreeMap::new())
                .await,
            Err(LedgerError::ProvenanceCheckFailed(_)),
        ));
        assert_eq!(ledger.latest_block().await.unwrap().unwrap().height, 2);

        let lineage = ledger.model_lineage("model-2").await.unwrap();
        assert_eq!(
            lineage
                .iter()
                .map(|block| block.height)
                .collect::<Vec<_>>(),
            vec![2, 1, 0],
        );
        assert_eq!(ledger.model_lineage("model-1").await.unwrap()[0].height, 1);
        assert_eq!(ledger.verify_chain().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tampering_is_detected_at_the_exact_height() {
        let (ledger, store) = chain(4).await;
        assert_eq!(ledger.verify_chain().await.unwrap(), 5);

        store.tamper_block(2, |row| row.num_clients = 7).await;
        assert!(matches!(
            ledger.verify_block(2).await,
            Err(LedgerError::HashMismatch { height: 2 }),
        ));
        assert!(ledger.verify_block(1).await.is_ok());
        assert!(matches!(
            ledger.verify_chain().await,
            Err(LedgerError::HashMismatch { height: 2 }),
        ));
        assert_eq!(ledger.is_halted(), Some(2));
        assert!(matches!(
            ledger
                .append(5, "model-5", "fedavg", 2, provenance(5), BTreeMap::new())
                .await,
            Err(LedgerError::Halted(2)),
        ));

        ledger.resume();
        assert_eq!(ledger.is_halted(), None);
    }

    #[tokio::test]
    async fn test_rehashed_block_breaks_the_chain() {
        let (ledger, store) = chain(3).await;
        let mut forged = ledger.block(1).await.unwrap();
        forged.model_hash = "forged".into();
        forged.block_hash = forged.compute_hash().unwrap();
        let forged = forged.to_row().unwrap();
        store.tamper_block(1, move |row| *row = forged).await;

        // the forged block itself is consistent, its successor is not
        assert!(ledger.verify_block(1).await.is_ok());
        assert!(matches!(
            ledger.verify_chain().await,
            Err(LedgerError::ChainDiscontinuity { height: 2 }),
        ));
    }

    #[tokio::test]
    async fn test_corrupt_provenance_is_a_hash_mismatch() {
        let (ledger, store) = chain(1).await;
        store
            .tamper_block(1, |row| row.provenance = "garbage".into())
            .await;
        assert!(matches!(
            ledger.verify_chain().await,
            Err(LedgerError::HashMismatch { height: 1 }),
        ));
    }

    #[tokio::test]
    async fn test_lineage_terminates_on_cycles() {
        let (ledger, store) = chain(3).await;
        store
            .tamper_provenance("model-3", |row| {
                row.parent_model_hash = Some("model-3".into())
            })
            .await;
        assert_eq!(ledger.model_lineage("model-3").await.unwrap().len(), 1);

        store
            .tamper_provenance("model-1", |row| {
                row.parent_model_hash = Some("model-2".into())
            })
            .await;
        let lineage = ledger.model_lineage("model-2").await.unwrap();
        assert_eq!(
            lineage
                .iter()
                .map(|block| block.height)
                .collect::<Vec<_>>(),
            vec![2, 1],
        );
        assert!(matches!(
            ledger.model_lineage("unknown").await,
            Err(LedgerError::UnknownModel(_)),
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_heights() {
        let (ledger, _) = chain(0).await;
        let ledger = Arc::new(ledger);
        let handles = (1..=8_u64)
            .map(|round| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    let mut provenance = provenance(round);
                    provenance.parent_model_hash = Some("model-0".into());
                    ledger
                        .append(
                            round,
                            format!("model-{}", round),
                            "fedavg",
                            2,
                            provenance,
                            BTreeMap::new(),
                        )
                        .await
                        .unwrap()
                        .height
                })
            })
            .collect::<Vec<_>>();
        let mut heights = Vec::new();
        for handle in handles {
            heights.push(handle.await.unwrap());
        }
        heights.sort_unstable();
        assert_eq!(heights, (1..=8).collect::<Vec<_>>());
        assert_eq!(ledger.verify_chain().await.unwrap(), 9);
    }
}

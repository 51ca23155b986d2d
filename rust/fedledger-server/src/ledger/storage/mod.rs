//! Storage backends of the ledger.
//!
//! Backends store the rows of two tables:
//!
//! - `blocks`, keyed by `height`, with a unique `block_hash` column. The provenance and the
//!   signatures of a block are stored serialized.
//! - `provenance_index`, keyed by `model_hash`, which points to the block that anchors a model
//!   and to the parent of the model.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::{file::FileStore, memory::MemoryStore};

/// The error type for storage operations that are not directly related to the ledger.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A row of the `blocks` table.
pub struct BlockRow {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub previous_block_hash: String,
    pub model_hash: String,
    pub aggregation_method: String,
    pub num_clients: usize,
    pub block_hash: String,
    /// The serialized provenance.
    pub provenance: String,
    /// The serialized signatures of the organizations.
    pub signatures: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A row of the `provenance_index` table.
pub struct ProvenanceRow {
    pub model_hash: String,
    pub block_height: u64,
    pub model_version: u64,
    pub parent_model_hash: Option<String>,
}

#[async_trait]
/// An abstract ledger store.
pub trait LedgerStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Inserts a block together with the provenance index row of its model.
    ///
    /// # Behavior
    ///
    /// - If neither the height, the block hash nor the model hash exist yet, insert the block
    ///   and its provenance row and return `StorageResult::Ok(())`.
    /// - Otherwise, store nothing and return an error.
    async fn insert_block(
        &mut self,
        block: &BlockRow,
        provenance: &ProvenanceRow,
    ) -> StorageResult<()>;

    /// Returns the block at the given height.
    async fn block(&mut self, height: u64) -> StorageResult<Option<BlockRow>>;

    /// Returns the block with the largest height.
    async fn latest_block(&mut self) -> StorageResult<Option<BlockRow>>;

    /// Returns all blocks in ascending height order.
    async fn blocks(&mut self) -> StorageResult<Vec<BlockRow>>;

    /// Returns the provenance index row of a model.
    async fn provenance(&mut self, model_hash: &str) -> StorageResult<Option<ProvenanceRow>>;

    /// Checks if the store is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the store is ready to process requests, return `StorageResult::Ok(())`.
    /// If the store cannot process requests because of a connection error, for example,
    /// return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The tables of a ledger store.
pub struct Tables {
    pub blocks: BTreeMap<u64, BlockRow>,
    pub provenance_index: BTreeMap<String, ProvenanceRow>,
}

impl Tables {
    /// Inserts a block and its provenance row, enforcing the unique keys of the tables.
    pub fn insert_block(
        &mut self,
        block: &BlockRow,
        provenance: &ProvenanceRow,
    ) -> StorageResult<()> {
        if self.blocks.contains_key(&block.height) {
            return Err(anyhow!("block at height {} already exists", block.height));
        }
        if self
            .blocks
            .values()
            .any(|row| row.block_hash == block.block_hash)
        {
            return Err(anyhow!("block hash {} already exists", block.block_hash));
        }
        if self.provenance_index.contains_key(&provenance.model_hash) {
            return Err(anyhow!(
                "model {} is already anchored",
                provenance.model_hash
            ));
        }
        self.blocks.insert(block.height, block.clone());
        self.provenance_index
            .insert(provenance.model_hash.clone(), provenance.clone());
        Ok(())
    }

    pub fn latest_block(&self) -> Option<BlockRow> {
        self.blocks.values().next_back().cloned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn block_row(height: u64, block_hash: &str) -> (BlockRow, ProvenanceRow) {
        let block = BlockRow {
            height,
            timestamp: Utc::now(),
            previous_block_hash: String::new(),
            model_hash: format!("model-{}", height),
            aggregation_method: "fedavg".into(),
            num_clients: 2,
            block_hash: block_hash.into(),
            provenance: "{}".into(),
            signatures: "{}".into(),
        };
        let provenance = ProvenanceRow {
            model_hash: block.model_hash.clone(),
            block_height: height,
            model_version: height,
            parent_model_hash: None,
        };
        (block, provenance)
    }

    /// Runs the behavior every backend has to provide.
    pub async fn check_backend<S: LedgerStorage>(mut store: S) {
        store.is_ready().await.unwrap();
        assert!(store.latest_block().await.unwrap().is_none());
        assert!(store.blocks().await.unwrap().is_empty());

        let (genesis, genesis_provenance) = block_row(0, "hash-0");
        store
            .insert_block(&genesis, &genesis_provenance)
            .await
            .unwrap();
        let (block, provenance) = block_row(1, "hash-1");
        store.insert_block(&block, &provenance).await.unwrap();

        // unique height
        let (duplicate, duplicate_provenance) = block_row(1, "hash-2");
        assert!(store
            .insert_block(&duplicate, &duplicate_provenance)
            .await
            .is_err());
        // unique block hash
        let (duplicate, duplicate_provenance) = block_row(2, "hash-1");
        assert!(store
            .insert_block(&duplicate, &duplicate_provenance)
            .await
            .is_err());
        assert!(store.provenance("model-2").await.unwrap().is_none());
        // unique model hash
        let (mut duplicate, mut duplicate_provenance) = block_row(2, "hash-2");
        duplicate.model_hash = "model-1".into();
        duplicate_provenance.model_hash = "model-1".into();
        assert!(store
            .insert_block(&duplicate, &duplicate_provenance)
            .await
            .is_err());

        assert_eq!(store.block(1).await.unwrap(), Some(block.clone()));
        assert_eq!(store.block(2).await.unwrap(), None);
        assert_eq!(store.latest_block().await.unwrap(), Some(block.clone()));
        assert_eq!(store.blocks().await.unwrap(), vec![genesis, block]);
        assert_eq!(
            store.provenance("model-1").await.unwrap(),
            Some(provenance)
        );
    }
}

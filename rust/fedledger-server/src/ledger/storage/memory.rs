//! An in-memory ledger store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ledger::storage::{BlockRow, LedgerStorage, ProvenanceRow, StorageResult, Tables};

#[derive(Clone, Default)]
/// A ledger store which keeps its tables in memory. Clones share the same tables.
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored block row without any checks.
    #[cfg(test)]
    pub(crate) async fn tamper_block<F>(&self, height: u64, tamper: F)
    where
        F: FnOnce(&mut BlockRow),
    {
        if let Some(row) = self.tables.write().await.blocks.get_mut(&height) {
            tamper(row);
        }
    }

    /// Overwrites a stored provenance row without any checks.
    #[cfg(test)]
    pub(crate) async fn tamper_provenance<F>(&self, model_hash: &str, tamper: F)
    where
        F: FnOnce(&mut ProvenanceRow),
    {
        if let Some(row) = self
            .tables
            .write()
            .await
            .provenance_index
            .get_mut(model_hash)
        {
            tamper(row);
        }
    }
}

#[async_trait]
impl LedgerStorage for MemoryStore {
    async fn insert_block(
        &mut self,
        block: &BlockRow,
        provenance: &ProvenanceRow,
    ) -> StorageResult<()> {
        self.tables.write().await.insert_block(block, provenance)
    }

    async fn block(&mut self, height: u64) -> StorageResult<Option<BlockRow>> {
        Ok(self.tables.read().await.blocks.get(&height).cloned())
    }

    async fn latest_block(&mut self) -> StorageResult<Option<BlockRow>> {
        Ok(self.tables.read().await.latest_block())
    }

    async fn blocks(&mut self) -> StorageResult<Vec<BlockRow>> {
        Ok(self.tables.read().await.blocks.values().cloned().collect())
    }

    async fn provenance(&mut self, model_hash: &str) -> StorageResult<Option<ProvenanceRow>> {
        Ok(self
            .tables
            .read()
            .await
            .provenance_index
            .get(model_hash)
            .cloned())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

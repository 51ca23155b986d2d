//! A ledger store backed by a JSON file.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{fs, sync::Mutex};
use tracing::debug;

use crate::ledger::storage::{BlockRow, LedgerStorage, ProvenanceRow, StorageResult, Tables};

#[derive(Clone)]
/// A ledger store which keeps its tables in memory and writes a snapshot of them to a file after
/// every insertion.
///
/// The snapshot is first written to a temporary file next to the target which then replaces the
/// target, so an interrupted write never leaves a truncated ledger behind.
pub struct FileStore {
    path: Arc<PathBuf>,
    tables: Arc<Mutex<Tables>>,
}

impl FileStore {
    /// Opens the ledger at `path`. A missing file is treated as an empty ledger.
    ///
    /// # Errors
    /// Fails if the file exists but can't be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if fs::metadata(&path).await.is_ok() {
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("failed to read ledger {}", path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse ledger {}", path.display()))?
        } else {
            Tables::default()
        };
        debug!("opened ledger file {}", path.display());
        Ok(Self {
            path: Arc::new(path),
            tables: Arc::new(Mutex::new(tables)),
        })
    }

    async fn persist(&self, tables: &Tables) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(tables)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, self.path.as_ref())
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStorage for FileStore {
    async fn insert_block(
        &mut self,
        block: &BlockRow,
        provenance: &ProvenanceRow,
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock().await;
        let mut updated = tables.clone();
        updated.insert_block(block, provenance)?;
        self.persist(&updated).await?;
        *tables = updated;
        Ok(())
    }

    async fn block(&mut self, height: u64) -> StorageResult<Option<BlockRow>> {
        Ok(self.tables.lock().await.blocks.get(&height).cloned())
    }

    async fn latest_block(&mut self) -> StorageResult<Option<BlockRow>> {
        Ok(self.tables.lock().await.latest_block())
    }

    async fn blocks(&mut self) -> StorageResult<Vec<BlockRow>> {
        Ok(self.tables.lock().await.blocks.values().cloned().collect())
    }

    async fn provenance(&mut self, model_hash: &str) -> StorageResult<Option<ProvenanceRow>> {
        Ok(self
            .tables
            .lock()
            .await
            .provenance_index
            .get(model_hash)
            .cloned())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::metadata(&dir)
            .await
            .with_context(|| format!("ledger directory {} is not accessible", dir.display()))?;
        Ok(())
    }
}

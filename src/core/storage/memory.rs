//! In-process backend. Nothing survives a restart.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{nothing_staged, AuditStore, BlocklistStore, StorageError, TrafficLogStore};
use crate::models::{AnomalyRecord, LogEntry, ScoredLogEntry};

#[derive(Default)]
pub struct MemoryLogStore {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryLogStore {
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl TrafficLogStore for MemoryLogStore {
    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.entries.read().await.clone())
    }

    async fn read_tail(&self, n: usize) -> Result<Vec<LogEntry>, StorageError> {
        let entries = self.entries.read().await;
        let skip = entries.len().saturating_sub(n);
        Ok(entries[skip..].to_vec())
    }
}

#[derive(Default)]
pub struct MemoryBlocklistStore {
    records: RwLock<Option<Vec<AnomalyRecord>>>,
}

#[async_trait]
impl BlocklistStore for MemoryBlocklistStore {
    async fn load(&self) -> Result<Option<Vec<AnomalyRecord>>, StorageError> {
        Ok(self.records.read().await.clone())
    }

    async fn replace(&self, records: Vec<AnomalyRecord>) -> Result<(), StorageError> {
        *self.records.write().await = Some(records);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditStore {
    entries: RwLock<Vec<ScoredLogEntry>>,
    staged: RwLock<Option<Vec<ScoredLogEntry>>>,
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn stage_scored(&self, entries: &[ScoredLogEntry]) -> Result<(), StorageError> {
        *self.staged.write().await = Some(entries.to_vec());
        Ok(())
    }

    async fn commit_scored(&self) -> Result<(), StorageError> {
        let staged = self.staged.write().await.take().ok_or_else(nothing_staged)?;
        *self.entries.write().await = staged;
        Ok(())
    }

    async fn read_scored(&self) -> Result<Vec<ScoredLogEntry>, StorageError> {
        Ok(self.entries.read().await.clone())
    }
}

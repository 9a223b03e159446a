//! Persistence for the traffic log, the scored audit log and the blocklist.
//!
//! Each logical table is a trait so the gateway, detector and dashboard can be
//! wired to the file, Redis or in-memory backend without knowing which.

pub mod file;
pub mod memory;
pub mod redis;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use thiserror::Error;

use crate::models::{AnomalyRecord, Config, LogEntry, ScoredLogEntry, StorageBackend};

pub use self::file::{FileAuditStore, FileBlocklistStore, FileLogStore};
pub use self::memory::{MemoryAuditStore, MemoryBlocklistStore, MemoryLogStore};
pub use self::redis::{RedisAuditStore, RedisBlocklistStore, RedisLogStore};

/// Errors raised by any storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Append-only record of every admitted request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrafficLogStore: Send + Sync {
    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError>;

    /// All entries in insertion order.
    async fn read_all(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// The last `n` entries in insertion order.
    async fn read_tail(&self, n: usize) -> Result<Vec<LogEntry>, StorageError> {
        let mut entries = self.read_all().await?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }
}

/// The set of blocked clients, replaced wholesale by each detection run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlocklistStore: Send + Sync {
    /// Current records, `None` if no run has ever written the blocklist.
    async fn load(&self) -> Result<Option<Vec<AnomalyRecord>>, StorageError>;

    /// Atomically swap in a new generation of records.
    async fn replace(&self, records: Vec<AnomalyRecord>) -> Result<(), StorageError>;

    async fn read(&self) -> Result<HashSet<String>, StorageError> {
        Ok(self
            .load()
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|record| record.client_id)
            .collect())
    }
}

/// Scored copy of the log kept for operators.
///
/// Writes are two-phase: a run stages its scored log, swaps the blocklist and
/// only then publishes the staged copy, so readers never pair a blocklist with
/// the scored log of a different run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Write `entries` aside. Replaces any earlier staged copy.
    async fn stage_scored(&self, entries: &[ScoredLogEntry]) -> Result<(), StorageError>;

    /// Publish the staged copy. Fails if nothing is staged.
    async fn commit_scored(&self) -> Result<(), StorageError>;

    async fn read_scored(&self) -> Result<Vec<ScoredLogEntry>, StorageError>;

    async fn write_scored(&self, entries: &[ScoredLogEntry]) -> Result<(), StorageError> {
        self.stage_scored(entries).await?;
        self.commit_scored().await
    }
}

fn nothing_staged() -> StorageError {
    StorageError::Unavailable("no scored log staged".to_string())
}

/// The three tables, shared by every component of the service.
#[derive(Clone)]
pub struct Stores {
    pub log: Arc<dyn TrafficLogStore>,
    pub blocklist: Arc<dyn BlocklistStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Stores {
    /// Open (and initialize where needed) the backend named in the configuration
    pub async fn open(config: &Config) -> Result<Self, StorageError> {
        match config.storage.backend {
            StorageBackend::File => {
                let dir = std::path::Path::new(&config.storage.data_dir);
                info!("Opening file storage in {}", dir.display());
                Ok(Self {
                    log: Arc::new(FileLogStore::open(dir).await?),
                    blocklist: Arc::new(FileBlocklistStore::new(dir)),
                    audit: Arc::new(FileAuditStore::new(dir)),
                })
            }
            StorageBackend::Redis => {
                info!("Opening Redis storage at {}", config.redis.url);
                let client = ::redis::Client::open(config.redis.url.as_str())?;
                Ok(Self {
                    log: Arc::new(RedisLogStore::new(client.clone())),
                    blocklist: Arc::new(RedisBlocklistStore::new(client.clone())),
                    audit: Arc::new(RedisAuditStore::new(client)),
                })
            }
            StorageBackend::Memory => {
                info!("Using in-memory storage, nothing will survive a restart");
                Ok(Self::in_memory())
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            log: Arc::new(MemoryLogStore::default()),
            blocklist: Arc::new(MemoryBlocklistStore::default()),
            audit: Arc::new(MemoryAuditStore::default()),
        }
    }
}

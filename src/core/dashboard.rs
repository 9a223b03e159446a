//! Read-only queries backing the dashboard.

use std::sync::Arc;

use super::storage::{BlocklistStore, StorageError, Stores, TrafficLogStore};
use crate::models::{AnomalyRecord, LogEntry};

pub struct Dashboard {
    log: Arc<dyn TrafficLogStore>,
    blocklist: Arc<dyn BlocklistStore>,
}

impl Dashboard {
    pub fn new(stores: &Stores) -> Self {
        Self {
            log: stores.log.clone(),
            blocklist: stores.blocklist.clone(),
        }
    }

    /// The most recent `limit` log entries, oldest first
    pub async fn list_recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        self.log.read_tail(limit).await
    }

    /// The most recent `limit` records of the current blocklist generation
    pub async fn list_recent_anomalies(&self, limit: usize) -> Result<Vec<AnomalyRecord>, StorageError> {
        let mut records = self.blocklist.load().await?.unwrap_or_default();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }

    /// Currently blocked clients, sorted
    pub async fn list_blocked_clients(&self) -> Result<Vec<String>, StorageError> {
        let mut clients: Vec<String> = self.blocklist.read().await?.into_iter().collect();
        clients.sort();
        Ok(clients)
    }
}

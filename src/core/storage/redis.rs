//! Redis backend, for deployments where several gateway processes share one
//! traffic log and blocklist.

use async_trait::async_trait;
use log::warn;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{nothing_staged, AuditStore, BlocklistStore, StorageError, TrafficLogStore};
use crate::models::{AnomalyRecord, LogEntry, ScoredLogEntry};

const TRAFFIC_LOG_KEY: &str = "guard:traffic_log";
const SCORED_LOG_KEY: &str = "guard:traffic_log_with_scores";
const BLOCKLIST_KEY: &str = "guard:anomalies";
const STAGING_TTL_SECS: usize = 3600;

/// Traffic log kept in a Redis list, appended with `RPUSH`
pub struct RedisLogStore {
    redis: redis::Client,
}

impl RedisLogStore {
    pub fn new(redis: redis::Client) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl TrafficLogStore for RedisLogStore {
    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.redis.get_async_connection().await?;
        conn.rpush::<_, _, ()>(TRAFFIC_LOG_KEY, json).await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LogEntry>, StorageError> {
        let mut conn = self.redis.get_async_connection().await?;
        let rows: Vec<String> = conn.lrange(TRAFFIC_LOG_KEY, 0, -1).await?;
        Ok(parse_rows(TRAFFIC_LOG_KEY, rows))
    }

    async fn read_tail(&self, n: usize) -> Result<Vec<LogEntry>, StorageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.get_async_connection().await?;
        let start = -(n.min(isize::MAX as usize) as isize);
        let rows: Vec<String> = conn.lrange(TRAFFIC_LOG_KEY, start, -1).await?;
        Ok(parse_rows(TRAFFIC_LOG_KEY, rows))
    }
}

/// Blocklist records kept in a Redis list, swapped in a `MULTI` block
pub struct RedisBlocklistStore {
    redis: redis::Client,
}

impl RedisBlocklistStore {
    pub fn new(redis: redis::Client) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl BlocklistStore for RedisBlocklistStore {
    async fn load(&self) -> Result<Option<Vec<AnomalyRecord>>, StorageError> {
        let mut conn = self.redis.get_async_connection().await?;
        let exists: bool = conn.exists(BLOCKLIST_KEY).await?;
        if !exists {
            return Ok(None);
        }
        let rows: Vec<String> = conn.lrange(BLOCKLIST_KEY, 0, -1).await?;
        Ok(Some(parse_rows(BLOCKLIST_KEY, rows)))
    }

    async fn replace(&self, records: Vec<AnomalyRecord>) -> Result<(), StorageError> {
        replace_list(&self.redis, BLOCKLIST_KEY, &records).await
    }
}

/// Scored log kept in a Redis list. Staged under a private key that is
/// renamed over the published one on commit.
pub struct RedisAuditStore {
    redis: redis::Client,
    staged: Mutex<Option<String>>,
}

impl RedisAuditStore {
    pub fn new(redis: redis::Client) -> Self {
        Self {
            redis,
            staged: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AuditStore for RedisAuditStore {
    async fn stage_scored(&self, entries: &[ScoredLogEntry]) -> Result<(), StorageError> {
        let key = format!("{}:staging:{}", SCORED_LOG_KEY, Uuid::new_v4().simple());
        replace_list(&self.redis, &key, entries).await?;

        let mut conn = self.redis.get_async_connection().await?;
        // Abandoned stages clean themselves up.
        conn.expire::<_, ()>(&key, STAGING_TTL_SECS).await?;

        if let Some(previous) = self.staged.lock().await.replace(key) {
            conn.del::<_, ()>(previous).await?;
        }
        Ok(())
    }

    async fn commit_scored(&self) -> Result<(), StorageError> {
        let mut staged = self.staged.lock().await;
        let key = staged.as_deref().ok_or_else(nothing_staged)?;

        let mut conn = self.redis.get_async_connection().await?;
        redis::pipe()
            .atomic()
            .rename(key, SCORED_LOG_KEY)
            .ignore()
            .persist(SCORED_LOG_KEY)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        *staged = None;
        Ok(())
    }

    async fn read_scored(&self) -> Result<Vec<ScoredLogEntry>, StorageError> {
        let mut conn = self.redis.get_async_connection().await?;
        let rows: Vec<String> = conn.lrange(SCORED_LOG_KEY, 0, -1).await?;
        Ok(parse_rows(SCORED_LOG_KEY, rows))
    }
}

/// `DEL` + `RPUSH` inside one transaction, so readers see one generation.
/// An empty list leaves an empty-string marker so "never written" and "written
/// empty" stay distinguishable.
async fn replace_list<T: Serialize>(
    redis: &redis::Client,
    key: &str,
    rows: &[T],
) -> Result<(), StorageError> {
    let mut values = rows
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() {
        values.push(String::new());
    }

    let mut conn = redis.get_async_connection().await?;
    redis::pipe()
        .atomic()
        .del(key)
        .ignore()
        .rpush(key, values)
        .ignore()
        .query_async::<_, ()>(&mut conn)
        .await?;
    Ok(())
}

fn parse_rows<T: DeserializeOwned>(key: &str, rows: Vec<String>) -> Vec<T> {
    rows.into_iter()
        .filter(|row| !row.is_empty())
        .filter_map(|row| match serde_json::from_str(&row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping unreadable row in {}: {}", key, e);
                None
            }
        })
        .collect()
}

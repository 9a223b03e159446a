//! File backend: JSON-lines traffic log plus rename-into-place snapshots.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::warn;
use serde::de::DeserializeOwned;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use super::{nothing_staged, AuditStore, BlocklistStore, StorageError, TrafficLogStore};
use crate::models::{AnomalyRecord, LogEntry, ScoredLogEntry};
use crate::utils::staging_path;

pub const TRAFFIC_LOG_FILE: &str = "traffic_log.jsonl";
pub const SCORED_LOG_FILE: &str = "traffic_log_with_scores.jsonl";
pub const BLOCKLIST_FILE: &str = "anomalies.json";

/// Append-only traffic log, one JSON object per line.
pub struct FileLogStore {
    path: PathBuf,
    /// Held across each append. `true` once the file is known to end on a
    /// line boundary.
    write_lock: Mutex<bool>,
}

impl FileLogStore {
    /// Open the log in `dir`, creating the directory and an empty log if absent
    pub async fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(TRAFFIC_LOG_FILE);
        OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            write_lock: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrafficLogStore for FileLogStore {
    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        // One write per line keeps concurrent appenders from interleaving.
        let mut tail_sealed = self.write_lock.lock().await;
        if !*tail_sealed {
            // A crash mid-append leaves an unterminated line. Close it off so
            // it stays a single unreadable row instead of swallowing ours.
            if !ends_on_line_boundary(&self.path).await? {
                warn!("Sealing torn trailing line in {}", self.path.display());
                line.insert(0, b'\n');
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        *tail_sealed = true;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LogEntry>, StorageError> {
        read_lines(&self.path).await
    }
}

async fn ends_on_line_boundary(path: &Path) -> Result<bool, StorageError> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

/// Blocklist snapshot, swapped by renaming a fully written temp file.
pub struct FileBlocklistStore {
    path: PathBuf,
}

impl FileBlocklistStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(BLOCKLIST_FILE),
        }
    }
}

#[async_trait]
impl BlocklistStore for FileBlocklistStore {
    async fn load(&self) -> Result<Option<Vec<AnomalyRecord>>, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Some(Vec::new())),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, records: Vec<AnomalyRecord>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(&records)?;
        write_atomically(&self.path, &bytes).await
    }
}

/// Scored log written wholesale after each run. A staged copy sits in a
/// sibling temp file until it is renamed over the published one.
pub struct FileAuditStore {
    path: PathBuf,
    staged: Mutex<Option<PathBuf>>,
}

impl FileAuditStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SCORED_LOG_FILE),
            staged: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn stage_scored(&self, entries: &[ScoredLogEntry]) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut bytes, entry)?;
            bytes.push(b'\n');
        }
        let staging = write_staged(&self.path, &bytes).await?;

        if let Some(previous) = self.staged.lock().await.replace(staging) {
            remove_quietly(&previous).await;
        }
        Ok(())
    }

    async fn commit_scored(&self) -> Result<(), StorageError> {
        let staging = self.staged.lock().await.take().ok_or_else(nothing_staged)?;
        if let Err(e) = fs::rename(&staging, &self.path).await {
            remove_quietly(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_scored(&self) -> Result<Vec<ScoredLogEntry>, StorageError> {
        read_lines(&self.path).await
    }
}

/// Write `bytes` to a fresh staging file next to `path` and sync it.
async fn write_staged(path: &Path, bytes: &[u8]) -> Result<PathBuf, StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let staging = staging_path(path);
    let mut file = fs::File::create(&staging).await?;
    let written = match file.write_all(bytes).await {
        Ok(()) => file.sync_all().await,
        Err(e) => Err(e),
    };
    drop(file);
    if let Err(e) = written {
        remove_quietly(&staging).await;
        return Err(e.into());
    }
    Ok(staging)
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let staging = write_staged(path, bytes).await?;
    if let Err(e) = fs::rename(&staging, path).await {
        remove_quietly(&staging).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// Parse complete lines only. A trailing line without its newline is a write
/// in progress and is left for the next reader.
async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let complete = match content.iter().rposition(|b| *b == b'\n') {
        Some(last) => &content[..=last],
        None => return Ok(Vec::new()),
    };

    let mut rows = Vec::new();
    for (index, line) in complete.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(row) => rows.push(row),
            Err(e) => warn!("Skipping unreadable row {} in {}: {}", index + 1, path.display(), e),
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::Utc;
    use tempfile::tempdir;

    fn entry(client_id: &str, response_time: f64) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            user_agent: "curl/8.0".to_string(),
            response_time: Some(response_time),
        }
    }

    fn record(client_id: &str) -> AnomalyRecord {
        AnomalyRecord {
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
            anomaly_score: -0.2,
        }
    }

    fn scored(client_id: &str, flagged: bool) -> ScoredLogEntry {
        ScoredLogEntry {
            entry: entry(client_id, 0.01),
            anomaly_score: if flagged { -0.1 } else { 0.1 },
            is_anomaly: flagged,
        }
    }

    fn staging_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    /// Each client's rows carry response times 0, 1, 2, ... in append order.
    fn assert_contiguous_per_client(rows: &[LogEntry]) {
        let mut next: HashMap<&str, f64> = HashMap::new();
        for row in rows {
            let expected = next.entry(row.client_id.as_str()).or_insert(0.0);
            assert_eq!(row.response_time, Some(*expected), "gap or reorder for {}", row.client_id);
            *expected += 1.0;
        }
    }

    #[tokio::test]
    async fn test_open_creates_empty_log() {
        let dir = tempdir().unwrap();
        let store = FileLogStore::open(&dir.path().join("nested")).await.unwrap();

        assert!(store.path().exists());
        assert!(store.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let dir = tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();

        for i in 0..5 {
            store.append(&entry(&format!("10.0.0.{}", i), 0.01 * i as f64)).await.unwrap();
        }

        let all = store.read_all().await.unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.client_id.as_str()).collect();
        assert_eq!(ids, vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);

        let tail = store.read_tail(2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].client_id, "10.0.0.3");
        assert_eq!(tail[1].client_id, "10.0.0.4");
    }

    #[tokio::test]
    async fn test_partial_and_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        store.append(&entry("10.0.0.1", 0.02)).await.unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).await.unwrap();
        file.write_all(b"not json at all\n").await.unwrap();
        file.write_all(b"{\"timestamp\":\"2024-01-01T00:00:00Z\",\"client_id\":\"10.0.0.2\"").await.unwrap();
        file.flush().await.unwrap();

        let all = store.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].client_id, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_torn_tail_is_sealed_before_next_append() {
        let dir = tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        store.append(&entry("10.0.0.1", 0.02)).await.unwrap();

        // Crash in the middle of an append
        let mut file = OpenOptions::new().append(true).open(store.path()).await.unwrap();
        file.write_all(b"{\"timestamp\":\"2024-01-01T00:00:00Z\",\"client_id\":\"torn\"").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        drop(store);

        let store = FileLogStore::open(dir.path()).await.unwrap();
        store.append(&entry("10.0.0.2", 0.03)).await.unwrap();
        store.append(&entry("10.0.0.3", 0.04)).await.unwrap();

        let ids: Vec<String> = store.read_all().await.unwrap().into_iter().map(|e| e.client_id).collect();
        assert_eq!(ids, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_never_torn_or_lost() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileLogStore::open(dir.path()).await.unwrap());

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                tokio::spawn(async move {
                    for seq in 0..50 {
                        store.append(&entry(&format!("10.0.0.{}", w), seq as f64)).await.unwrap();
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            let rows = store.read_all().await.unwrap();
            assert!(rows.len() >= seen);
            seen = rows.len();
            assert_contiguous_per_client(&rows);
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let rows = store.read_all().await.unwrap();
        assert_eq!(rows.len(), 200);
        assert_contiguous_per_client(&rows);
    }

    #[tokio::test]
    async fn test_missing_response_time_is_kept_raw() {
        let dir = tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).await.unwrap();
        file.write_all(
            b"{\"timestamp\":\"2024-01-01T00:00:00Z\",\"client_id\":\"10.0.0.9\",\"method\":\"GET\",\"path\":\"/\"}\n",
        )
        .await
        .unwrap();
        file.flush().await.unwrap();

        let all = store.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].response_time, None);
        assert_eq!(all[0].user_agent, "");
        assert_eq!(all[0].valid_response_time(), None);
    }

    #[tokio::test]
    async fn test_blocklist_absent_then_replaced() {
        let dir = tempdir().unwrap();
        let store = FileBlocklistStore::new(dir.path());

        assert_eq!(store.load().await.unwrap(), None);
        assert!(store.read().await.unwrap().is_empty());

        let record = record("10.0.0.7");
        store.replace(vec![record.clone()]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(vec![record]));
        assert!(store.read().await.unwrap().contains("10.0.0.7"));
        assert!(staging_files(dir.path()).is_empty());

        store.replace(Vec::new()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_blocklist_replaces_do_not_collide() {
        let dir = tempdir().unwrap();

        // Two handles on one directory, as the server and the one-shot binary have
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = FileBlocklistStore::new(dir.path());
                tokio::spawn(async move { store.replace(vec![record(&format!("10.0.0.{}", i))]).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let records = FileBlocklistStore::new(dir.path()).load().await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert!(staging_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_audit_overwrites_previous_run() {
        let dir = tempdir().unwrap();
        let store = FileAuditStore::new(dir.path());

        store.write_scored(&[scored("a", false), scored("b", true)]).await.unwrap();
        store.write_scored(&[scored("c", false)]).await.unwrap();

        let rows = store.read_scored().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.client_id, "c");
    }

    #[tokio::test]
    async fn test_staged_scores_hidden_until_commit() {
        let dir = tempdir().unwrap();
        let store = FileAuditStore::new(dir.path());
        store.write_scored(&[scored("a", false)]).await.unwrap();

        store.stage_scored(&[scored("b", true)]).await.unwrap();
        store.stage_scored(&[scored("c", true)]).await.unwrap();
        assert_eq!(store.read_scored().await.unwrap()[0].entry.client_id, "a");
        assert_eq!(staging_files(dir.path()).len(), 1);

        store.commit_scored().await.unwrap();
        let rows = store.read_scored().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.client_id, "c");
        assert!(staging_files(dir.path()).is_empty());

        assert!(matches!(store.commit_scored().await, Err(StorageError::Unavailable(_))));
    }
}

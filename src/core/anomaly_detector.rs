//! Batch anomaly detection over logged response times.
//!
//! Every run retrains an isolation forest from scratch on the whole traffic
//! log, scores each entry, stages the scored log for auditing, replaces the
//! blocklist with the clients that produced outliers and then publishes the
//! staged scored log. Clients that stop
//! producing outliers drop off the blocklist on the next run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use metrics::{gauge, increment_counter};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use super::isolation_forest::{IsolationForestParams, ModelError};
use super::storage::{AuditStore, BlocklistStore, StorageError, Stores, TrafficLogStore};
use crate::models::{AnomalyRecord, DetectorConfig, LogEntry, ScoredLogEntry};

/// Why a run did not produce a new blocklist
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("no traffic data found")]
    NoData,
    #[error("not enough data points to detect anomalies ({found} valid, {required} required)")]
    InsufficientData { found: usize, required: usize },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("detection task failed: {0}")]
    Task(String),
}

impl DetectionError {
    /// Runs skipped for lack of input rather than failed
    pub fn is_skip(&self) -> bool {
        matches!(self, DetectionError::NoData | DetectionError::InsufficientData { .. })
    }

    fn status(&self) -> &'static str {
        match self {
            DetectionError::NoData => "no_data",
            DetectionError::InsufficientData { .. } => "insufficient_data",
            _ => "failed",
        }
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_entries: usize,
    pub valid_entries: usize,
    /// Flagged entries in log order
    pub anomalies: Vec<ScoredLogEntry>,
    /// The blocklist written by this run
    pub blocked: Vec<AnomalyRecord>,
}

pub struct AnomalyDetector {
    log: Arc<dyn TrafficLogStore>,
    blocklist: Arc<dyn BlocklistStore>,
    audit: Arc<dyn AuditStore>,
    config: DetectorConfig,
    run_lock: Mutex<()>,
}

impl AnomalyDetector {
    pub fn new(stores: &Stores, config: DetectorConfig) -> Self {
        Self {
            log: stores.log.clone(),
            blocklist: stores.blocklist.clone(),
            audit: stores.audit.clone(),
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Run one detection pass. Overlapping calls are serialized.
    pub async fn run(&self) -> Result<DetectionReport, DetectionError> {
        let _guard = self.run_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let entries = self.log.read_all().await?;
        if entries.is_empty() {
            return Err(DetectionError::NoData);
        }
        let total_entries = entries.len();

        let cutoff = self
            .config
            .lookback_hours
            .map(|hours| started_at - chrono::Duration::hours(hours));
        let valid: Vec<LogEntry> = entries
            .into_iter()
            .filter(|e| cutoff.map_or(true, |c| e.timestamp >= c))
            .filter(|e| e.valid_response_time().is_some())
            .collect();

        let required = self.config.min_samples.max(2);
        if valid.len() < required {
            return Err(DetectionError::InsufficientData {
                found: valid.len(),
                required,
            });
        }
        let valid_entries = valid.len();

        let params = IsolationForestParams {
            n_estimators: self.config.n_estimators,
            max_samples: self.config.max_samples,
            contamination: self.config.contamination,
            random_seed: self.config.random_seed,
        };
        let scored = tokio::task::spawn_blocking(move || score_entries(&params, valid))
            .await
            .map_err(|e| DetectionError::Task(e.to_string()))??;

        let anomalies: Vec<ScoredLogEntry> = scored.iter().filter(|s| s.is_anomaly).cloned().collect();
        let blocked = summarize(&anomalies);

        // Stage, swap, publish: a failure before the swap keeps both the old
        // blocklist and the old scored log.
        self.audit.stage_scored(&scored).await?;
        self.blocklist.replace(blocked.clone()).await?;
        if let Err(e) = self.audit.commit_scored().await {
            error!(
                "Run {}: blocklist replaced but scored log not published: {}",
                run_id, e
            );
            return Err(e.into());
        }

        gauge!("guard_blocked_clients", blocked.len() as f64);
        if anomalies.is_empty() {
            info!("Run {}: no anomalies in {} entries", run_id, valid_entries);
        } else {
            warn!(
                "Run {}: {} anomalous entries from {} clients",
                run_id,
                anomalies.len(),
                blocked.len()
            );
            for a in &anomalies {
                warn!(
                    "  {} {} {} {} score={:.4}",
                    a.entry.timestamp.to_rfc3339(),
                    a.entry.client_id,
                    a.entry.method,
                    a.entry.path,
                    a.anomaly_score
                );
            }
        }

        Ok(DetectionReport {
            run_id,
            started_at,
            total_entries,
            valid_entries,
            anomalies,
            blocked,
        })
    }
}

fn score_entries(
    params: &IsolationForestParams,
    entries: Vec<LogEntry>,
) -> Result<Vec<ScoredLogEntry>, DetectionError> {
    let values: Vec<f64> = entries.iter().filter_map(LogEntry::valid_response_time).collect();
    let forest = params.fit(&values)?;

    Ok(entries
        .into_iter()
        .zip(values)
        .map(|(entry, value)| {
            let anomaly_score = forest.decision_function(value);
            ScoredLogEntry {
                entry,
                anomaly_score,
                is_anomaly: anomaly_score < 0.0,
            }
        })
        .collect())
}

/// One record per flagged client, taken from its most anomalous entry.
fn summarize(anomalies: &[ScoredLogEntry]) -> Vec<AnomalyRecord> {
    let mut worst: BTreeMap<&str, &ScoredLogEntry> = BTreeMap::new();
    for scored in anomalies {
        worst
            .entry(scored.entry.client_id.as_str())
            .and_modify(|current| {
                if scored.anomaly_score < current.anomaly_score {
                    *current = scored;
                }
            })
            .or_insert(scored);
    }

    let mut records: Vec<AnomalyRecord> = worst
        .into_values()
        .map(|s| AnomalyRecord {
            timestamp: s.entry.timestamp,
            client_id: s.entry.client_id.clone(),
            anomaly_score: s.anomaly_score,
        })
        .collect();
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.client_id.cmp(&b.client_id)));
    records
}

/// Periodic trigger for the detector
pub struct DetectionScheduler;

impl DetectionScheduler {
    /// Run `detector` every `interval` until the returned task is aborted
    pub fn spawn(detector: Arc<AnomalyDetector>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting anomaly detection every {:?}", interval);
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                run_and_report(&detector).await;
            }
        })
    }
}

/// Run once and report the outcome on the operator channel
pub async fn run_and_report(detector: &AnomalyDetector) -> Option<DetectionReport> {
    match detector.run().await {
        Ok(report) => {
            increment_counter!("guard_detector_runs_total", "status" => "completed");
            info!(
                "Detection run {} completed: {} of {} entries scored, {} clients blocked",
                report.run_id,
                report.valid_entries,
                report.total_entries,
                report.blocked.len()
            );
            Some(report)
        }
        Err(e) if e.is_skip() => {
            increment_counter!("guard_detector_runs_total", "status" => e.status());
            info!("Detection skipped: {}", e);
            None
        }
        Err(e) => {
            increment_counter!("guard_detector_runs_total", "status" => e.status());
            error!("Detection failed, blocklist left unchanged: {}", e);
            None
        }
    }
}

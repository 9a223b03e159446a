use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per window for clients that are not blocklisted
    pub normal_limit: u32,
    /// Requests per window for blocklisted clients
    pub strict_limit: u32,
    /// Time window in seconds
    pub window_seconds: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            normal_limit: 20,
            strict_limit: 5,
            window_seconds: 60,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Where the traffic log, scored log and blocklist live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Redis,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend holding the three tables
    pub backend: StorageBackend,
    /// Directory for the file backend
    pub data_dir: String,
    /// Upper bound on a blocklist read from the request path
    pub read_timeout_ms: u64,
    /// Capacity of the queue between the gateway and the log writer
    pub queue_capacity: usize,
    /// Append attempts before an entry is given up on
    pub append_retries: u32,
}

impl StorageConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: "data".to_string(),
            read_timeout_ms: 250,
            queue_capacity: 1024,
            append_retries: 3,
        }
    }
}

/// Request gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Reject blocklisted clients outright. When off they are only held to
    /// the strict rate-limit tier.
    pub enforce_blocklist: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enforce_blocklist: true,
        }
    }
}

/// Anomaly detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Expected share of outliers in the log
    pub contamination: f64,
    /// Valid entries required before a run is attempted
    pub min_samples: usize,
    /// Number of isolation trees
    pub n_estimators: usize,
    /// Sub-sample size per tree (capped by the number of samples)
    pub max_samples: usize,
    /// Seed for tree construction
    pub random_seed: u64,
    /// Seconds between scheduled runs, 0 disables the scheduler
    pub interval_seconds: u64,
    /// Only consider entries younger than this many hours
    #[serde(default)]
    pub lookback_hours: Option<i64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            min_samples: 10,
            n_estimators: 100,
            max_samples: 256,
            random_seed: 42,
            interval_seconds: 300,
            lookback_hours: None,
        }
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Request gateway configuration
    pub gateway: GatewayConfig,
    /// Rate limit configuration
    pub rate_limit: RateLimitConfig,
    /// Anomaly detector configuration
    pub detector: DetectorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            storage: StorageConfig::default(),
            gateway: GatewayConfig::default(),
            rate_limit: RateLimitConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

/// One completed request as written to the traffic log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub user_agent: String,
    /// Seconds. `None` for rows written without a usable timing.
    #[serde(default)]
    pub response_time: Option<f64>,
}

impl LogEntry {
    /// The response time, if it is usable as detection input.
    pub fn valid_response_time(&self) -> Option<f64> {
        self.response_time.filter(|rt| rt.is_finite() && *rt >= 0.0)
    }
}

/// A log entry as scored by the most recent detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLogEntry {
    #[serde(flatten)]
    pub entry: LogEntry,
    /// Higher is more normal, negative values are outliers.
    pub anomaly_score: f64,
    pub is_anomaly: bool,
}

/// One flagged client from a detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub anomaly_score: f64,
}

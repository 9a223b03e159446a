//! Core functionality for the latency anomaly guard.
//!
//! This module contains the feedback loop: the request gateway, the traffic
//! log writer, the stores, the anomaly detector and the dashboard queries.

pub mod anomaly_detector;
pub mod dashboard;
pub mod gateway;
pub mod isolation_forest;
pub mod rate_limiter;
pub mod storage;
pub mod traffic_logger;

pub use anomaly_detector::{AnomalyDetector, DetectionError, DetectionReport, DetectionScheduler};
pub use dashboard::Dashboard;
pub use gateway::{Admission, Gateway, Rejection, RequestInfo, RequestTimer};
pub use isolation_forest::{IsolationForest, IsolationForestParams};
pub use rate_limiter::{RateLimit, RateLimiter, RateTier};
pub use storage::{StorageError, Stores};
pub use traffic_logger::{LogWriter, TrafficLogger};

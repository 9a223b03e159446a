//! Latency Anomaly Guard
//!
//! Times every request, detects clients whose response latencies are outliers
//! and feeds the result back into admission control as a blocklist and a
//! stricter rate-limit tier.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;

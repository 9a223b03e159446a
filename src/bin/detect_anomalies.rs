//! One-shot anomaly detection run.
//!
//! Refreshes the blocklist from the configured stores and exits. Meant for
//! cron or manual use when the in-process scheduler is disabled.

use std::process::ExitCode;

use anyhow::Context;
use dotenv::dotenv;
use log::{error, info};

use latency_anomaly_guard::config;
use latency_anomaly_guard::core::{AnomalyDetector, Stores};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::load_config().context("Failed to load configuration")?;
    let stores = Stores::open(&config).await.context("Failed to open storage")?;
    let detector = AnomalyDetector::new(&stores, config.detector.clone());

    match detector.run().await {
        Ok(report) => {
            info!(
                "Run {}: {} anomalous entries, {} clients blocked",
                report.run_id,
                report.anomalies.len(),
                report.blocked.len()
            );
            for record in &report.blocked {
                info!("  blocked {} (score {:.4})", record.client_id, record.anomaly_score);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_skip() => {
            info!("Nothing to do: {}", e);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Detection failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

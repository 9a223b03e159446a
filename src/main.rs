//! Latency Anomaly Guard
//!
//! This is the main entry point for the service. It opens the stores, starts
//! the traffic log writer and the detection scheduler, and serves the
//! protected application behind the gateway middleware.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use latency_anomaly_guard::api::{self, ApiState, GatewayMiddleware};
use latency_anomaly_guard::config;
use latency_anomaly_guard::core::{
    AnomalyDetector, Dashboard, DetectionScheduler, Gateway, RateLimiter, Stores, TrafficLogger,
};
use latency_anomaly_guard::models::StorageBackend;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Latency Anomaly Guard...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics recorder not installed: {}", e);
            None
        }
    };

    let stores = Stores::open(&config).await.context("Failed to open storage")?;

    let (logger, writer) = TrafficLogger::spawn(stores.log.clone(), &config.storage);

    let limiter = match config.storage.backend {
        StorageBackend::Redis => RateLimiter::redis(
            redis::Client::open(config.redis.url.as_str()).context("Failed to create Redis client")?,
        ),
        _ => RateLimiter::in_memory(),
    };

    let gateway = Arc::new(Gateway::new(
        stores.blocklist.clone(),
        limiter,
        logger.clone(),
        config.rate_limit.clone(),
        config.gateway.clone(),
        config.storage.read_timeout(),
    ));

    let detector = Arc::new(AnomalyDetector::new(&stores, config.detector.clone()));
    let scheduler = if config.detector.interval_seconds > 0 {
        Some(DetectionScheduler::spawn(
            detector,
            Duration::from_secs(config.detector.interval_seconds),
        ))
    } else {
        info!("Detection scheduler disabled, run detect_anomalies to refresh the blocklist");
        None
    };

    let state = web::Data::new(ApiState {
        dashboard: Dashboard::new(&stores),
        metrics,
    });

    info!("Listening on {}:{}", config.server.host, config.server.port);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(GatewayMiddleware::new(gateway.clone()))
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    info!("Shutting down, flushing traffic log...");
    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    writer.shutdown(logger).await;

    Ok(())
}

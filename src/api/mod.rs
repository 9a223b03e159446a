//! HTTP endpoints for the latency anomaly guard.
//!
//! The landing page is the protected handler; the remaining routes are the
//! read-only dashboard API over the traffic log and the blocklist.

pub mod middleware;

use actix_web::{web, HttpResponse, Responder};
use log::error;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::{Dashboard, StorageError};

pub use middleware::GatewayMiddleware;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Traffic Anomaly Dashboard</title></head>
<body>
<h1>Traffic Anomaly Dashboard</h1>
<p>Data endpoints: <a href="/logs">/logs</a>, <a href="/anomalies">/anomalies</a>,
<a href="/blocked_ips">/blocked_ips</a></p>
</body>
</html>
"#;

pub struct ApiState {
    pub dashboard: Dashboard,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/metrics").route(web::get().to(metrics)))
        .service(web::resource("/logs").route(web::get().to(logs)))
        .service(web::resource("/anomalies").route(web::get().to(anomalies)))
        .service(web::resource("/blocked_ips").route(web::get().to(blocked_ips)));
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// `?limit=` for the listing endpoints
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

async fn index() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Most recent raw log entries
async fn logs(state: web::Data<ApiState>, query: web::Query<LimitQuery>) -> impl Responder {
    match state.dashboard.list_recent_logs(query.limit()).await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(e) => storage_unavailable(e),
    }
}

/// Most recent anomaly records of the current blocklist
async fn anomalies(state: web::Data<ApiState>, query: web::Query<LimitQuery>) -> impl Responder {
    match state.dashboard.list_recent_anomalies(query.limit()).await {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(e) => storage_unavailable(e),
    }
}

async fn blocked_ips(state: web::Data<ApiState>) -> impl Responder {
    match state.dashboard.list_blocked_clients().await {
        Ok(clients) => HttpResponse::Ok().json(clients),
        Err(e) => storage_unavailable(e),
    }
}

fn storage_unavailable(e: StorageError) -> HttpResponse {
    error!("Dashboard query failed: {}", e);
    HttpResponse::ServiceUnavailable().json(serde_json::json!({ "error": "Storage unavailable" }))
}

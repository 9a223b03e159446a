//! Request admission, adaptive rate limiting and timing.
//!
//! Transport-agnostic: the HTTP layer extracts a [`RequestInfo`], asks
//! [`Gateway::admit`] for a decision and keeps the returned [`RequestTimer`]
//! alive for the duration of the handler.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use metrics::{histogram, increment_counter};
use thiserror::Error;

use super::rate_limiter::{RateLimit, RateLimitError, RateLimiter, RateTier};
use super::storage::BlocklistStore;
use super::traffic_logger::TrafficLogger;
use crate::models::{GatewayConfig, LogEntry, RateLimitConfig};

/// Why a request was turned away before reaching its handler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("Access Denied: Suspicious activity detected")]
    Blocked,
    #[error("Too many requests, slow down!")]
    RateLimitExceeded { tier: RateTier, limit: RateLimit },
}

/// The parts of a request the gateway cares about
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub client_id: String,
    pub method: String,
    pub path: String,
    pub user_agent: String,
}

/// Admission decision for a single request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub tier: RateTier,
    pub limit: RateLimit,
}

pub struct Gateway {
    blocklist: Arc<dyn BlocklistStore>,
    limiter: RateLimiter,
    logger: TrafficLogger,
    rate_config: RateLimitConfig,
    gateway_config: GatewayConfig,
    read_timeout: Duration,
}

impl Gateway {
    pub fn new(
        blocklist: Arc<dyn BlocklistStore>,
        limiter: RateLimiter,
        logger: TrafficLogger,
        rate_config: RateLimitConfig,
        gateway_config: GatewayConfig,
        read_timeout: Duration,
    ) -> Self {
        Self {
            blocklist,
            limiter,
            logger,
            rate_config,
            gateway_config,
            read_timeout,
        }
    }

    /// Current blocklist. An absent, failing or slow store reads as empty.
    pub async fn blocklist_snapshot(&self) -> HashSet<String> {
        match tokio::time::timeout(self.read_timeout, self.blocklist.read()).await {
            Ok(Ok(blocked)) => blocked,
            Ok(Err(e)) => {
                warn!("Blocklist unavailable, admitting as unblocked: {}", e);
                HashSet::new()
            }
            Err(_) => {
                warn!("Blocklist read exceeded {:?}, admitting as unblocked", self.read_timeout);
                HashSet::new()
            }
        }
    }

    /// Run the admission and rate-limit checks for `client_id`
    pub async fn admit(&self, client_id: &str) -> Result<Admission, Rejection> {
        let blocked = self.blocklist_snapshot().await;

        if self.gateway_config.enforce_blocklist && blocked.contains(client_id) {
            warn!("Rejected blocklisted client {}", client_id);
            increment_counter!("guard_requests_total", "outcome" => "blocked");
            return Err(Rejection::Blocked);
        }

        let tier = RateTier::select(client_id, &blocked);
        let limit = tier.limit(&self.rate_config);

        match self.limiter.check_rate_limit(client_id, limit).await {
            Ok(()) => {}
            Err(RateLimitError::ExceededLimit) => {
                warn!("Rate limit {} ({} tier) exceeded by {}", limit, tier, client_id);
                increment_counter!("guard_requests_total", "outcome" => "rate_limited");
                return Err(Rejection::RateLimitExceeded { tier, limit });
            }
            Err(e) => warn!("Rate limiter unavailable, admitting {}: {}", client_id, e),
        }

        debug!("Admitted {} on the {} tier", client_id, tier);
        increment_counter!("guard_requests_total", "outcome" => "admitted");
        Ok(Admission { tier, limit })
    }

    /// Start timing an admitted request
    pub fn start(&self, request: RequestInfo) -> RequestTimer {
        RequestTimer {
            request: Some(request),
            started: Instant::now(),
            logger: self.logger.clone(),
        }
    }
}

/// Times one request and logs it exactly once: on [`RequestTimer::finish`],
/// or on drop if the request was cancelled first.
pub struct RequestTimer {
    request: Option<RequestInfo>,
    started: Instant,
    logger: TrafficLogger,
}

impl RequestTimer {
    /// Log the request with its full duration
    pub fn finish(mut self) -> Duration {
        self.record()
    }

    fn record(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if let Some(request) = self.request.take() {
            histogram!("guard_response_time_seconds", elapsed.as_secs_f64());
            self.logger.record_now(|timestamp| LogEntry {
                timestamp,
                client_id: request.client_id,
                method: request.method,
                path: request.path,
                user_agent: request.user_agent,
                response_time: Some(elapsed.as_secs_f64()),
            });
        }
        elapsed
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        if self.request.is_some() {
            debug!("Request ended before completion, logging partial duration");
            self.record();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::{
        MemoryBlocklistStore, MemoryLogStore, MockBlocklistStore, StorageError, TrafficLogStore,
    };
    use crate::core::traffic_logger::LogWriter;
    use crate::models::{AnomalyRecord, StorageConfig};
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio_test::assert_ok;

    struct Harness {
        gateway: Gateway,
        blocklist: Arc<MemoryBlocklistStore>,
        log: Arc<MemoryLogStore>,
        logger: TrafficLogger,
        writer: LogWriter,
    }

    fn harness(rate_config: RateLimitConfig, gateway_config: GatewayConfig) -> Harness {
        let blocklist = Arc::new(MemoryBlocklistStore::default());
        let log = Arc::new(MemoryLogStore::default());
        let (logger, writer) = TrafficLogger::spawn(log.clone(), &StorageConfig::default());
        let gateway = Gateway::new(
            blocklist.clone(),
            RateLimiter::in_memory(),
            logger.clone(),
            rate_config,
            gateway_config,
            Duration::from_millis(250),
        );
        Harness {
            gateway,
            blocklist,
            log,
            logger,
            writer,
        }
    }

    fn request(client_id: &str) -> RequestInfo {
        RequestInfo {
            client_id: client_id.to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            user_agent: "test-agent".to_string(),
        }
    }

    fn record(client_id: &str) -> AnomalyRecord {
        AnomalyRecord {
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
            anomaly_score: -0.2,
        }
    }

    #[tokio::test]
    async fn test_admitted_requests_are_logged_once() {
        let h = harness(RateLimitConfig::default(), GatewayConfig::default());

        for _ in 0..5 {
            let admission = h.gateway.admit("10.0.0.1").await.unwrap();
            assert_eq!(admission.tier, RateTier::Normal);
            h.gateway.start(request("10.0.0.1")).finish();
        }
        h.logger.flush().await;

        let entries = h.log.read_all().await.unwrap();
        assert_eq!(entries.len(), 5);
        assert!(entries.iter().all(|e| e.response_time.unwrap() >= 0.0));
        assert!(entries.iter().all(|e| e.user_agent == "test-agent"));

        h.writer.shutdown(h.logger).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_logged_in_time_order() {
        let h = harness(
            RateLimitConfig {
                normal_limit: 1000,
                strict_limit: 5,
                window_seconds: 60,
            },
            GatewayConfig::default(),
        );
        let gateway = Arc::new(h.gateway);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        gateway.admit("10.0.0.1").await.unwrap();
                        let timer = gateway.start(request("10.0.0.1"));
                        tokio::task::yield_now().await;
                        timer.finish();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        h.logger.flush().await;

        let entries = h.log.read_all().await.unwrap();
        assert_eq!(entries.len(), 200);
        assert!(entries.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));

        h.writer.shutdown(h.logger).await;
    }

    #[tokio::test]
    async fn test_blocked_until_blocklist_is_replaced() {
        let h = harness(RateLimitConfig::default(), GatewayConfig::default());
        h.blocklist.replace(vec![record("10.0.0.66")]).await.unwrap();

        for _ in 0..3 {
            assert_eq!(h.gateway.admit("10.0.0.66").await, Err(Rejection::Blocked));
        }
        assert_ok!(h.gateway.admit("10.0.0.1").await);

        h.blocklist.replace(Vec::new()).await.unwrap();
        assert_ok!(h.gateway.admit("10.0.0.66").await);

        h.writer.shutdown(h.logger).await;
    }

    #[tokio::test]
    async fn test_rate_limit_is_distinct_from_blocking() {
        let rate_config = RateLimitConfig {
            normal_limit: 2,
            strict_limit: 1,
            window_seconds: 60,
        };
        let h = harness(rate_config, GatewayConfig::default());

        assert_ok!(h.gateway.admit("10.0.0.2").await);
        assert_ok!(h.gateway.admit("10.0.0.2").await);
        match h.gateway.admit("10.0.0.2").await {
            Err(Rejection::RateLimitExceeded { tier, limit }) => {
                assert_eq!(tier, RateTier::Normal);
                assert_eq!(limit.max_requests, 2);
            }
            other => panic!("expected rate limit rejection, got {:?}", other),
        }

        assert_eq!(h.blocklist.load().await.unwrap(), None);

        h.writer.shutdown(h.logger).await;
    }

    #[tokio::test]
    async fn test_throttle_mode_applies_strict_tier() {
        let rate_config = RateLimitConfig {
            normal_limit: 10,
            strict_limit: 1,
            window_seconds: 60,
        };
        let h = harness(rate_config, GatewayConfig { enforce_blocklist: false });
        h.blocklist.replace(vec![record("10.0.0.66")]).await.unwrap();

        let admission = h.gateway.admit("10.0.0.66").await.unwrap();
        assert_eq!(admission.tier, RateTier::Strict);
        assert!(matches!(
            h.gateway.admit("10.0.0.66").await,
            Err(Rejection::RateLimitExceeded { tier: RateTier::Strict, .. })
        ));

        h.writer.shutdown(h.logger).await;
    }

    #[tokio::test]
    async fn test_failing_blocklist_reads_as_empty() {
        let mut blocklist = MockBlocklistStore::new();
        blocklist
            .expect_read()
            .returning(|| Err(StorageError::Unavailable("corrupt".to_string())));

        let log = Arc::new(MemoryLogStore::default());
        let (logger, writer) = TrafficLogger::spawn(log, &StorageConfig::default());
        let gateway = Gateway::new(
            Arc::new(blocklist),
            RateLimiter::in_memory(),
            logger.clone(),
            RateLimitConfig::default(),
            GatewayConfig::default(),
            Duration::from_millis(250),
        );

        let admission = gateway.admit("10.0.0.3").await.unwrap();
        assert_eq!(admission.tier, RateTier::Normal);

        writer.shutdown(logger).await;
    }

    struct StalledBlocklist;

    #[async_trait]
    impl BlocklistStore for StalledBlocklist {
        async fn load(&self) -> Result<Option<Vec<AnomalyRecord>>, StorageError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(vec![record("10.0.0.4")]))
        }

        async fn replace(&self, _records: Vec<AnomalyRecord>) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_blocklist_times_out() {
        let log = Arc::new(MemoryLogStore::default());
        let (logger, writer) = TrafficLogger::spawn(log, &StorageConfig::default());
        let gateway = Gateway::new(
            Arc::new(StalledBlocklist),
            RateLimiter::in_memory(),
            logger.clone(),
            RateLimitConfig::default(),
            GatewayConfig::default(),
            Duration::from_millis(250),
        );

        assert_ok!(gateway.admit("10.0.0.4").await);

        writer.shutdown(logger).await;
    }

    #[tokio::test]
    async fn test_cancelled_request_still_logged() {
        let h = harness(RateLimitConfig::default(), GatewayConfig::default());

        let timer = h.gateway.start(request("10.0.0.5"));
        drop(timer);
        h.logger.flush().await;

        let entries = h.log.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].client_id, "10.0.0.5");

        h.writer.shutdown(h.logger).await;
    }
}

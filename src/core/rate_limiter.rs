//! Adaptive rate limiting for the latency anomaly guard.
//!
//! Every request counts on entry against a fixed window that expires on its
//! own, so requests that never complete cannot leak counter state. The limit a
//! client is held to depends on its tier: blocklisted clients get the strict
//! ceiling, everyone else the normal one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::Instant;

use crate::models::RateLimitConfig;
use crate::utils::format_rate_limit_key;

/// Windows kept in memory before expired ones are swept. Sweeps run at most
/// once per window length.
const SWEEP_THRESHOLD: usize = 10_000;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Rate limit exceeded")]
    ExceededLimit,
}

/// Rate-limit tier of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    Strict,
    Normal,
}

impl RateTier {
    /// Strict for blocklisted clients, normal otherwise
    pub fn select(client_id: &str, blocklist: &HashSet<String>) -> Self {
        if blocklist.contains(client_id) {
            RateTier::Strict
        } else {
            RateTier::Normal
        }
    }

    /// The ceiling this tier is held to under `config`
    pub fn limit(self, config: &RateLimitConfig) -> RateLimit {
        let max_requests = match self {
            RateTier::Strict => config.strict_limit,
            RateTier::Normal => config.normal_limit,
        };
        RateLimit {
            max_requests,
            window: Duration::from_secs(u64::from(config.window_seconds)),
        }
    }
}

impl fmt::Display for RateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateTier::Strict => write!(f, "strict"),
            RateTier::Normal => write!(f, "normal"),
        }
    }
}

/// Requests allowed per window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {}s", self.max_requests, self.window.as_secs())
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
}

#[derive(Debug)]
struct Windows {
    by_key: HashMap<String, Window>,
    last_sweep: Instant,
}

enum Counters {
    Memory(Mutex<Windows>),
    Redis(redis::Client),
}

/// Rate limiter with an in-process or Redis-backed counter store
pub struct RateLimiter {
    counters: Counters,
}

impl RateLimiter {
    /// Counters held in this process
    pub fn in_memory() -> Self {
        Self {
            counters: Counters::Memory(Mutex::new(Windows {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            })),
        }
    }

    /// Counters shared through Redis
    pub fn redis(redis: redis::Client) -> Self {
        Self {
            counters: Counters::Redis(redis),
        }
    }

    /// Count a request from `key` and check it against `limit`
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the request should be allowed
    /// * `Err(RateLimitError::ExceededLimit)` if the rate limit has been exceeded
    /// * `Err(RateLimitError::RedisError)` if there was an error communicating with Redis
    pub async fn check_rate_limit(&self, key: &str, limit: RateLimit) -> Result<(), RateLimitError> {
        let count = match &self.counters {
            Counters::Memory(windows) => hit_memory(windows, key, limit.window),
            Counters::Redis(client) => hit_redis(client, key, limit.window).await?,
        };

        if count > limit.max_requests {
            return Err(RateLimitError::ExceededLimit);
        }

        Ok(())
    }

    /// Reset the rate limit for a given key
    pub async fn reset_rate_limit(&self, key: &str) -> Result<(), RateLimitError> {
        match &self.counters {
            Counters::Memory(windows) => {
                lock(windows).by_key.remove(key);
            }
            Counters::Redis(client) => {
                let window_key = format_rate_limit_key("rate_limit", key);
                let mut conn = client.get_async_connection().await?;
                conn.del::<_, ()>(&window_key).await?;
            }
        }
        Ok(())
    }
}

fn lock(windows: &Mutex<Windows>) -> std::sync::MutexGuard<'_, Windows> {
    // A poisoned map only holds counters, which are safe to keep using.
    windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn hit_memory(windows: &Mutex<Windows>, key: &str, window: Duration) -> u32 {
    let now = Instant::now();
    let mut windows = lock(windows);

    if windows.by_key.len() >= SWEEP_THRESHOLD && now.duration_since(windows.last_sweep) >= window {
        windows.by_key.retain(|_, w| now.duration_since(w.started) < window);
        windows.last_sweep = now;
    }

    let entry = windows
        .by_key
        .entry(key.to_string())
        .or_insert(Window { count: 0, started: now });
    if now.duration_since(entry.started) >= window {
        entry.count = 0;
        entry.started = now;
    }
    entry.count = entry.count.saturating_add(1);
    entry.count
}

/// `INCR` and `TTL` go out in one transaction. A key left without an expiry
/// (a request dropped before its `EXPIRE`, or a failed `EXPIRE`) gets one on
/// the next hit, so no counter outlives its window by more than one request.
async fn hit_redis(client: &redis::Client, key: &str, window: Duration) -> Result<u32, RateLimitError> {
    let window_key = format_rate_limit_key("rate_limit", key);
    let mut conn = client.get_async_connection().await?;

    let (count, ttl): (u32, i64) = redis::pipe()
        .atomic()
        .incr(&window_key, 1)
        .ttl(&window_key)
        .query_async(&mut conn)
        .await?;

    if needs_expiry(ttl) {
        conn.expire::<_, ()>(&window_key, window.as_secs().max(1) as usize)
            .await?;
    }

    Ok(count)
}

/// `TTL` answers -1 for a key without an expiry
fn needs_expiry(ttl: i64) -> bool {
    ttl < 0
}

//! Configuration management for the latency anomaly guard.
//!
//! Built-in defaults are layered under an optional TOML file and
//! `GUARD_`-prefixed environment variables (`__` separates sections).

use std::env;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8000)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("storage.backend", "file")?
        .set_default("storage.data_dir", "data")?
        .set_default("storage.read_timeout_ms", 250)?
        .set_default("storage.queue_capacity", 1024)?
        .set_default("storage.append_retries", 3)?
        .set_default("gateway.enforce_blocklist", true)?
        .set_default("rate_limit.normal_limit", 20)?
        .set_default("rate_limit.strict_limit", 5)?
        .set_default("rate_limit.window_seconds", 60)?
        .set_default("detector.contamination", 0.05)?
        .set_default("detector.min_samples", 10)?
        .set_default("detector.n_estimators", 100)?
        .set_default("detector.max_samples", 256)?
        .set_default("detector.random_seed", 42)?
        .set_default("detector.interval_seconds", 300)?
        .add_source(File::with_name(&config_file).required(false))
        .add_source(
            Environment::with_prefix("GUARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StorageBackend;

    #[test]
    fn test_defaults_without_file() {
        env::set_var("CONFIG_FILE", "does/not/exist.toml");
        let config = load_config().unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert!(config.gateway.enforce_blocklist);
        assert_eq!(config.rate_limit.normal_limit, 20);
        assert_eq!(config.rate_limit.strict_limit, 5);
        assert_eq!(config.detector.min_samples, 10);
        assert!((config.detector.contamination - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.detector.lookback_hours, None);
    }
}

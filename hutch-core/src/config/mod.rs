pub mod constants;
pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use std::path::Path;

impl HutchConfig {
    /// Load configuration
    ///
    /// Sources, lowest precedence first: built-in defaults, the optional
    /// TOML file, then `HUTCH_` environment variables (`.env` is read
    /// first). Sections are separated by `__`, e.g.
    /// `HUTCH_CONNECTION__MAX_RECONNECT_ATTEMPTS=5`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Missing .env is normal
        let _ = dotenvy::dotenv();

        let mut builder = ConfigLoader::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("HUTCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        // Every field carries a serde default, so absent keys fall back
        let cfg: HutchConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let url = self.broker.url.as_str();
        if !(url.starts_with("amqp://") || url.starts_with("amqps://")) {
            anyhow::bail!("Invalid broker url '{}', must start with amqp:// or amqps://", url);
        }

        if self.connection.max_reconnect_attempts == 0 {
            anyhow::bail!("max_reconnect_attempts must be positive");
        }

        if self.connection.channel_max_retries == 0 {
            anyhow::bail!("channel_max_retries must be positive");
        }

        if self.connection.max_reconnect_delay_ms < self.connection.reconnect_delay_ms {
            anyhow::bail!("max_reconnect_delay_ms cannot be less than reconnect_delay_ms");
        }

        if self.connection.health_check_interval_ms == 0 {
            anyhow::bail!("health_check_interval_ms must be positive");
        }

        if self.retry.max_retries == 0 {
            anyhow::bail!("retry.max_retries must be positive");
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("retry.max_delay_ms cannot be less than retry.base_delay_ms");
        }

        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be positive");
        }

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.monitoring.log_level,
                valid_log_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = HutchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.queue, "task_queue");
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.consumer.resubscribe_delay_ms, 5_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = HutchConfig::default();

        config.broker.url = "http://localhost".to_string();
        assert!(config.validate().is_err());
        config.broker.url = "amqps://broker:5671".to_string();
        assert!(config.validate().is_ok());

        config.connection.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());
        config.connection.max_reconnect_attempts = 10;

        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());
        config.retry.max_delay_ms = 10_000;

        config.monitoring.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[broker]
url = "amqp://rabbit:5672"
queue = "orders"

[retry]
max_retries = 7
"#
        )
        .unwrap();

        let config = HutchConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.broker.url, "amqp://rabbit:5672");
        assert_eq!(config.broker.queue, "orders");
        assert_eq!(config.broker.exchange, "task_exchange");
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn test_derived_durations() {
        let config = HutchConfig::default();
        let backoff = config.retry.backoff();
        assert_eq!(backoff.base_delay.as_millis(), 1_000);
        assert_eq!(backoff.max_delay.as_millis(), 10_000);

        let breaker = config.circuit_breaker.breaker_config();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout.as_millis(), 30_000);
    }
}

use super::constants::*;
use crate::resilience::backoff::BackoffConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HutchConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Broker address and default target names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
    pub publisher_tag: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            publisher_tag: DEFAULT_PUBLISHER_TAG.to_string(),
        }
    }
}

/// Session lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub health_check_interval_ms: u64,
    pub channel_max_retries: u32,
    pub channel_retry_delay_ms: u64,
    pub connection_timeout_ms: u64,
    pub jitter_window_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            max_reconnect_delay_ms: MAX_RECONNECT_DELAY_MS,
            health_check_interval_ms: HEALTH_CHECK_INTERVAL_MS,
            channel_max_retries: CHANNEL_MAX_RETRIES,
            channel_retry_delay_ms: CHANNEL_RETRY_DELAY_MS,
            connection_timeout_ms: CONNECTION_TIMEOUT_MS,
            jitter_window_ms: JITTER_WINDOW_MS,
        }
    }
}

impl ConnectionConfig {
    /// Backoff used between reconnection attempts
    pub fn reconnect_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            jitter_window: Duration::from_millis(self.jitter_window_ms),
        }
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn channel_retry_delay(&self) -> Duration {
        Duration::from_millis(self.channel_retry_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Circuit breaker thresholds as read from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    /// Per-call operation timeout
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            timeout_ms: OPERATION_TIMEOUT_MS,
            reset_timeout_ms: RESET_TIMEOUT_MS,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            operation_timeout: Duration::from_millis(self.timeout_ms),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }
}

/// Publish retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_window_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay_ms: RETRY_BASE_DELAY_MS,
            max_delay_ms: RETRY_MAX_DELAY_MS,
            jitter_window_ms: JITTER_WINDOW_MS,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_window: Duration::from_millis(self.jitter_window_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub resubscribe_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            resubscribe_delay_ms: RESUBSCRIBE_DELAY_MS,
        }
    }
}

impl ConsumerConfig {
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

/// Health reporting, metrics endpoint and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_report_interval_ms: u64,
    pub metrics_report_interval_ms: u64,
    /// Metrics/health HTTP server address
    pub metrics_addr: String,
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
    /// Enable JSON logging
    pub json_logs: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_report_interval_ms: HEALTH_REPORT_INTERVAL_MS,
            metrics_report_interval_ms: METRICS_REPORT_INTERVAL_MS,
            metrics_addr: METRICS_ADDR.to_string(),
            log_level: LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }
}

impl MonitoringConfig {
    pub fn health_report_interval(&self) -> Duration {
        Duration::from_millis(self.health_report_interval_ms)
    }

    pub fn metrics_report_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_report_interval_ms)
    }
}

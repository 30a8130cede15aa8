//! Built-in configuration defaults
//!
//! Durations are in milliseconds. Every value can be overridden from a TOML
//! file or `HUTCH_`-prefixed environment variables.

// ===== BROKER =====

pub const DEFAULT_BROKER_URL: &str = "amqp://localhost:5672";
pub const DEFAULT_QUEUE: &str = "task_queue";
pub const DEFAULT_EXCHANGE: &str = "task_exchange";
pub const DEFAULT_ROUTING_KEY: &str = "task_routing_key";
pub const DEFAULT_CONSUMER_TAG: &str = "task_consumer";
pub const DEFAULT_PUBLISHER_TAG: &str = "task_publisher";

// ===== CONNECTION =====

/// Reconnect attempts per cycle before the long cool-down
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Base delay of the reconnect backoff
pub const RECONNECT_DELAY_MS: u64 = 5_000;

/// Backoff cap, also the cool-down after an exhausted cycle
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

pub const HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

pub const CHANNEL_MAX_RETRIES: u32 = 3;

/// Linear step between channel creation attempts
pub const CHANNEL_RETRY_DELAY_MS: u64 = 1_000;

/// Bound on waiting for a healthy session before an operation
pub const CONNECTION_TIMEOUT_MS: u64 = 10_000;

pub const JITTER_WINDOW_MS: u64 = 1_000;

// ===== CIRCUIT BREAKER =====

pub const FAILURE_THRESHOLD: u32 = 5;
pub const OPERATION_TIMEOUT_MS: u64 = 60_000;
pub const RESET_TIMEOUT_MS: u64 = 30_000;

// ===== RETRY =====

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const RETRY_MAX_DELAY_MS: u64 = 10_000;

// ===== CONSUMER =====

/// Fixed delay before resubscribing after a disconnection
pub const RESUBSCRIBE_DELAY_MS: u64 = 5_000;

// ===== MONITORING =====

pub const HEALTH_REPORT_INTERVAL_MS: u64 = 30_000;
pub const METRICS_REPORT_INTERVAL_MS: u64 = 60_000;
pub const METRICS_ADDR: &str = "127.0.0.1:9090";
pub const LOG_LEVEL: &str = "info";

/// Errors above this count mark the service as degraded
pub const DEGRADED_ERROR_THRESHOLD: u64 = 10;

//! Resilience patterns
//!
//! - Exponential backoff with jitter
//! - Reconnection loop with attempt budget and cool-down
//! - Session health probing
//! - Circuit breaker

pub mod backoff;
pub mod circuit_breaker;
pub mod health;
pub mod reconnect;

pub use backoff::{linear_delay, BackoffConfig};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats,
};
pub use health::{probe_channel, run_health_monitor, HealthTarget};
pub use reconnect::{run_reconnect_loop, ReconnectOutcome, ReconnectPolicy, Reconnectable};

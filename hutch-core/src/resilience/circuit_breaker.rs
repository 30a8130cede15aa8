//! Circuit breaker pattern for preventing cascade failures
//!
//! Wraps arbitrary async operations. After `failure_threshold` consecutive
//! failures the breaker trips and sheds calls without running them. Once
//! `reset_timeout` has elapsed a single probe is let through (HalfOpen);
//! success closes the circuit, failure re-opens it.
//!
//! ```text
//!     CLOSED ──fail(N)──→ OPEN ──reset_timeout──→ HALFOPEN
//!        ▲                  ▲                        │
//!        │                  └─────────fail───────────┤
//!        └──────────────────success──────────────────┘
//! ```
//!
//! The breaker is a policy callers opt into: wrap a whole retry loop in
//! [`CircuitBreaker::execute`] to stop hammering a backend that stays down.

use crate::core::errors::HutchError;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit tripped, requests fail fast
    Open,
    /// Testing if service recovered
    HalfOpen,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Upper bound on a single wrapped operation; exceeding it is a failure
    pub operation_timeout: Duration,
    /// How long to stay Open before allowing a HalfOpen probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            operation_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a call shed or failed by the breaker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// Circuit is open; the operation was not invoked
    #[error("circuit breaker is open, retry in {retry_in:?}")]
    Open { retry_in: Duration },

    /// The operation exceeded `operation_timeout`
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// The wrapped operation's error, if that is what failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CircuitError<HutchError>> for HutchError {
    fn from(err: CircuitError<HutchError>) -> Self {
        match err {
            CircuitError::Open { retry_in } => HutchError::CircuitOpen { retry_in },
            CircuitError::Timeout(after) => {
                HutchError::Connection(format!("operation timed out after {:?}", after))
            }
            CircuitError::Inner(e) => e,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    total_rejections: u64,
}

/// Circuit breaker shared by one family of operations
///
/// Clones share the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in Closed state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        info!("Creating circuit breaker '{}' with config: {:?}", name, config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                total_rejections: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` under the breaker
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match tokio::time::timeout(self.config.operation_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                self.on_failure();
                Err(CircuitError::Timeout(self.config.operation_timeout))
            }
        }
    }

    /// Decide whether a call may proceed, moving Open → HalfOpen when due
    fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure_time
            .map(|t| t.elapsed())
            .unwrap_or(self.config.reset_timeout);

        if elapsed > self.config.reset_timeout {
            debug!(
                "Circuit breaker '{}' transitioning to HALF-OPEN (testing recovery)",
                self.name
            );
            inner.state = CircuitState::HalfOpen;
            Ok(())
        } else {
            inner.total_rejections += 1;
            Err(CircuitError::Open {
                retry_in: self.config.reset_timeout.saturating_sub(elapsed),
            })
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker '{}' transitioning to CLOSED", self.name);
        }
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());

        if inner.failure_count >= self.config.failure_threshold
            && inner.state != CircuitState::Open
        {
            warn!(
                "Circuit breaker '{}' TRIPPED after {} failures - transitioning to OPEN",
                self.name, inner.failure_count
            );
            inner.state = CircuitState::Open;
        } else if inner.state == CircuitState::HalfOpen {
            // Probe failed below threshold (threshold was lowered or reset)
            inner.state = CircuitState::Open;
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            total_rejections: inner.total_rejections,
        }
    }

    /// Reset circuit breaker to Closed state
    pub fn reset(&self) {
        info!("Circuit breaker '{}' manually reset to CLOSED", self.name);
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_time = None;
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

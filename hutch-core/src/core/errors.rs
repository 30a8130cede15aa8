//! Error taxonomy for the resilience layer
//!
//! Transport failures on the session itself are recovered by the session
//! manager and only surface through the health snapshot. Everything listed
//! here reaches the immediate caller of a publish/consume/check operation.

use crate::transport::{TransportError, TransportErrorKind};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for hutch operations
pub type Result<T> = std::result::Result<T, HutchError>;

/// Errors surfaced by the session manager, publisher, consumer and checker
#[derive(Error, Debug, Clone)]
pub enum HutchError {
    /// Connection or channel could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// No healthy session appeared within the wait bound
    #[error("timed out after {0:?} waiting for a healthy session")]
    ConnectionTimeout(Duration),

    /// Publish retry budget exhausted
    #[error("publish failed after {attempts} attempts: {last_error}")]
    PublishFailed {
        /// Number of send attempts performed
        attempts: u32,
        /// Failure of the final attempt
        last_error: String,
    },

    /// Operation shed by an open circuit breaker
    #[error("circuit breaker is open, retry in {retry_in:?}")]
    CircuitOpen {
        /// Remaining cool-down before a half-open probe is allowed
        retry_in: Duration,
    },

    /// Single-shot introspection query failed
    #[error("check of '{target}' failed: {reason}")]
    CheckFailed { target: String, reason: String },

    /// Application handler failed; contained and answered with nack+requeue
    #[error("consumer callback failed: {0}")]
    ConsumerCallback(String),

    /// Conflicting declaration or invalid settings; never retried
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker operation failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session manager was closed or the operation was cancelled
    #[error("session closed")]
    Closed,
}

impl HutchError {
    /// Whether a bounded retry loop should try again after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            HutchError::Configuration(_) | HutchError::Closed | HutchError::CircuitOpen { .. }
        )
    }

    /// Map a declare failure, promoting property conflicts to configuration errors
    pub fn from_declare(err: TransportError) -> Self {
        match err.kind() {
            TransportErrorKind::PreconditionFailed => {
                HutchError::Configuration(err.message().to_string())
            }
            _ => HutchError::Transport(err),
        }
    }

    pub fn check_failed(target: impl Into<String>, reason: impl ToString) -> Self {
        HutchError::CheckFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

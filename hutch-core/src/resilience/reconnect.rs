//! Reconnection loop with exponential backoff
//!
//! Drives any [`Reconnectable`] resource back to health. One cycle makes up
//! to `max_attempts` backed-off attempts; when a cycle is exhausted the
//! counter is reset and a single attempt is made after `cooldown`, after
//! which a new cycle starts. The loop only ends on recovery or cancellation.

use super::backoff::BackoffConfig;
use crate::config::ConnectionConfig;
use crate::core::errors::HutchError;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempt budget and pacing for reconnection
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Attempts per cycle
    pub max_attempts: u32,
    /// Delay before each attempt, indexed by the failed-attempt counter
    pub backoff: BackoffConfig,
    /// Wait after an exhausted cycle
    pub cooldown: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts.max(1),
            backoff: config.reconnect_backoff(),
            cooldown: config.max_reconnect_delay(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// A resource the reconnect loop can restore
///
/// The attempt counter lives with the resource so it can be observed from
/// outside while the loop runs.
#[async_trait]
pub trait Reconnectable: Send + Sync {
    /// One full connect attempt
    async fn attempt(&self) -> Result<(), HutchError>;

    fn is_healthy(&self) -> bool;

    /// Failed attempts in the current cycle
    fn attempts(&self) -> u32;

    /// Count a failed attempt, returning the new counter
    fn record_failure(&self, err: &HutchError) -> u32;

    fn reset_attempts(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Recovered,
    Cancelled,
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Run the reconnection loop until the target is healthy or `cancel` fires
pub async fn run_reconnect_loop<R>(
    target: &R,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> ReconnectOutcome
where
    R: Reconnectable + ?Sized,
{
    loop {
        while target.attempts() < policy.max_attempts && !target.is_healthy() {
            let attempt = target.attempts();
            let delay = policy.backoff.delay(attempt);
            debug!(
                "Reconnect attempt {}/{} in {:?}",
                attempt + 1,
                policy.max_attempts,
                delay
            );

            if !sleep_or_cancel(delay, cancel).await {
                return ReconnectOutcome::Cancelled;
            }

            match target.attempt().await {
                Ok(()) => {
                    info!("Reconnected after {} failed attempts", attempt);
                    return ReconnectOutcome::Recovered;
                }
                Err(HutchError::Closed) => return ReconnectOutcome::Cancelled,
                Err(e) => {
                    let failures = target.record_failure(&e);
                    warn!(
                        "Reconnect attempt {}/{} failed: {}",
                        failures, policy.max_attempts, e
                    );
                }
            }
        }

        if target.is_healthy() {
            return ReconnectOutcome::Recovered;
        }

        error!(
            "Reconnect budget of {} attempts exhausted, retrying in {:?}",
            policy.max_attempts, policy.cooldown
        );
        target.reset_attempts();

        if !sleep_or_cancel(policy.cooldown, cancel).await {
            return ReconnectOutcome::Cancelled;
        }

        match target.attempt().await {
            Ok(()) => {
                info!("Reconnected after cool-down");
                return ReconnectOutcome::Recovered;
            }
            Err(HutchError::Closed) => return ReconnectOutcome::Cancelled,
            Err(e) => {
                target.record_failure(&e);
                warn!("Reconnect after cool-down failed: {}", e);
            }
        }
    }
}

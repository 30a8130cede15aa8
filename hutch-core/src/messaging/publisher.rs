//! Retrying publisher
//!
//! Each attempt acquires a healthy session (bounded by the connection
//! timeout), declares the target and sends a persistent message. A broker
//! that does not accept the message counts as a failed attempt. Attempts
//! are separated by exponential backoff; conflicting declarations and
//! cancellation end the loop immediately.

use super::target::Target;
use crate::config::HutchConfig;
use crate::connection::SessionManager;
use crate::core::errors::{HutchError, Result};
use crate::monitoring::ServiceMonitor;
use crate::resilience::backoff::BackoffConfig;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::transport::{TransportError, TransportErrorKind};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Attempt budget; the publisher default when `None`
    pub max_retries: Option<u32>,
    /// Abandon the publish when cancelled
    pub cancel: Option<CancellationToken>,
}

impl PublishOptions {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Clone)]
pub struct RetryingPublisher {
    session: SessionManager,
    backoff: BackoffConfig,
    max_retries: u32,
    monitor: Option<ServiceMonitor>,
}

impl RetryingPublisher {
    pub fn new(session: SessionManager, backoff: BackoffConfig, max_retries: u32) -> Self {
        Self {
            session,
            backoff,
            max_retries: max_retries.max(1),
            monitor: None,
        }
    }

    pub fn from_config(session: SessionManager, config: &HutchConfig) -> Self {
        Self::new(session, config.retry.backoff(), config.retry.max_retries)
    }

    /// Report published messages and failures into `monitor`
    pub fn with_monitor(mut self, monitor: ServiceMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Publish with the default retry budget
    pub async fn publish(&self, target: &Target, payload: &[u8]) -> Result<()> {
        self.publish_with(target, payload, PublishOptions::default())
            .await
    }

    pub async fn publish_with(
        &self,
        target: &Target,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        let max_retries = options.max_retries.unwrap_or(self.max_retries).max(1);
        let cancel = options.cancel.unwrap_or_default();
        let closed = self.session.cancellation_token();
        let mut last_error = String::new();

        for attempt in 0..max_retries {
            if cancel.is_cancelled() || closed.is_cancelled() {
                return Err(HutchError::Closed);
            }

            let outcome = tokio::select! {
                outcome = self.try_publish(target, payload) => outcome,
                _ = cancel.cancelled() => return Err(HutchError::Closed),
                _ = closed.cancelled() => return Err(HutchError::Closed),
            };

            match outcome {
                Ok(()) => {
                    debug!(
                        "Published {} bytes to {} on attempt {}",
                        payload.len(),
                        target,
                        attempt + 1
                    );
                    if let Some(monitor) = &self.monitor {
                        monitor.record_message_published();
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    error!("Publish to {} failed permanently: {}", target, e);
                    self.record_error();
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Publish attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        max_retries,
                        target,
                        e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < max_retries {
                if let Some(monitor) = &self.monitor {
                    monitor.record_publish_retry();
                }
                let delay = self.backoff.delay(attempt);
                debug!("Retrying publish to {} in {:?}", target, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(HutchError::Closed),
                    _ = closed.cancelled() => return Err(HutchError::Closed),
                }
            }
        }

        error!(
            "Publish to {} failed after {} attempts: {}",
            target, max_retries, last_error
        );
        self.record_error();
        Err(HutchError::PublishFailed {
            attempts: max_retries,
            last_error,
        })
    }

    /// Publish inside `breaker`; an open circuit sheds the call untried
    pub async fn publish_guarded(
        &self,
        breaker: &CircuitBreaker,
        target: &Target,
        payload: &[u8],
    ) -> Result<()> {
        breaker
            .execute(|| self.publish(target, payload))
            .await
            .map_err(HutchError::from)
    }

    async fn try_publish(&self, target: &Target, payload: &[u8]) -> Result<()> {
        let (_, channel) = self.session.acquire(self.connection_timeout()).await?;
        target.declare_for_publish(channel.as_ref()).await?;

        let (exchange, routing_key) = target.publish_route();
        match channel.publish(exchange, routing_key, payload, true).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(HutchError::Transport(TransportError::new(
                TransportErrorKind::Other,
                "message not accepted by broker",
            ))),
            Err(e) => Err(HutchError::Transport(e)),
        }
    }

    fn connection_timeout(&self) -> Duration {
        self.session.config().connection_timeout()
    }

    fn record_error(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.record_error("publish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use crate::testing::{MockBroker, PublishOutcome};
    use crate::transport::QueueOptions;
    use std::sync::Arc;

    fn publisher(broker: &MockBroker, max_retries: u32) -> RetryingPublisher {
        let session =
            SessionManager::new("amqp://mock", ConnectionConfig::default(), Arc::new(broker.clone()));
        let backoff = BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter_window: Duration::ZERO,
        };
        RetryingPublisher::new(session, backoff, max_retries)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let broker = MockBroker::new();
        broker.script_publishes([PublishOutcome::Fail, PublishOutcome::NotSent]);
        let publisher = publisher(&broker, 5);

        publisher
            .publish(&Target::queue("orders"), b"hello")
            .await
            .unwrap();

        assert_eq!(broker.publish_attempts(), 3);
        assert_eq!(broker.published().len(), 1);
        assert!(broker.published()[0].persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let broker = MockBroker::new();
        broker.script_publishes([PublishOutcome::Fail; 3]);
        let publisher = publisher(&broker, 3);

        let err = publisher
            .publish(&Target::queue("orders"), b"hello")
            .await
            .unwrap_err();

        match err {
            HutchError::PublishFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(broker.publish_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_declare_is_not_retried() {
        let broker = MockBroker::new();
        broker.declare_queue("orders", QueueOptions::temporary());
        let publisher = publisher(&broker, 3);

        let err = publisher
            .publish(&Target::queue("orders"), b"hello")
            .await
            .unwrap_err();

        assert!(matches!(err, HutchError::Configuration(_)));
        assert_eq!(broker.assert_queue_calls("orders"), 1);
        assert_eq!(broker.publish_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_publish() {
        let broker = MockBroker::new();
        broker.script_publishes([PublishOutcome::Fail; 10]);
        let publisher = publisher(&broker, 10);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            c.cancel();
        });

        let err = publisher
            .publish_with(
                &Target::queue("orders"),
                b"hello",
                PublishOptions::default().cancel(cancel),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HutchError::Closed));
        // Attempts at 0ms and 100ms, cancelled during the 200ms backoff
        assert_eq!(broker.publish_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_waiting_attempt() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker, 3);
        publisher.session.ensure_session().await.unwrap();

        // Reconnection keeps failing, so the attempt waits on the session
        broker.fail_next_connects(u32::MAX);
        broker.drop_connection();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            c.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = publisher
            .publish_with(
                &Target::queue("orders"),
                b"hello",
                PublishOptions::default().cancel(cancel),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HutchError::Closed));
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(broker.publish_attempts(), 0);
        publisher.session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_publish_sheds_when_open() {
        let broker = MockBroker::new();
        broker.script_publishes([PublishOutcome::Fail; 2]);
        let publisher = publisher(&broker, 1);
        let breaker = CircuitBreaker::new(
            "publish",
            CircuitBreakerConfig {
                failure_threshold: 2,
                operation_timeout: Duration::from_secs(30),
                reset_timeout: Duration::from_secs(60),
            },
        );
        let target = Target::queue("orders");

        assert!(publisher.publish_guarded(&breaker, &target, b"1").await.is_err());
        assert!(publisher.publish_guarded(&breaker, &target, b"2").await.is_err());

        let err = publisher
            .publish_guarded(&breaker, &target, b"3")
            .await
            .unwrap_err();
        assert!(matches!(err, HutchError::CircuitOpen { .. }));
        assert_eq!(broker.publish_attempts(), 2);
    }
}

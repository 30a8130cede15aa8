//! Queue and exchange introspection
//!
//! Single-shot passive lookups. A failed passive declare closes the channel it
//! ran on, so every check opens its own short-lived channel on the session
//! connection instead of using the shared one.

use crate::connection::SessionManager;
use crate::core::errors::{HutchError, Result};
use crate::transport::{BrokerChannel, TransportErrorKind};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Checker {
    session: SessionManager,
}

impl Checker {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    /// Message and consumer counts of an existing queue
    pub async fn queue_info(&self, name: &str) -> Result<crate::transport::QueueInfo> {
        let channel = self.open_channel(name).await?;
        let result = channel.check_queue(name).await;
        release(channel).await;

        result.map_err(|e| HutchError::check_failed(name, e))
    }

    /// Whether the exchange exists; lookup failures other than "not found" are errors
    pub async fn exchange_exists(&self, name: &str) -> Result<bool> {
        let channel = self.open_channel(name).await?;
        let result = channel.check_exchange(name).await;
        release(channel).await;

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == TransportErrorKind::NotFound => Ok(false),
            Err(e) => Err(HutchError::check_failed(name, e)),
        }
    }

    async fn open_channel(&self, target: &str) -> Result<Arc<dyn BrokerChannel>> {
        let (connection, _) = self
            .session
            .ensure_session()
            .await
            .map_err(|e| HutchError::check_failed(target, e))?;

        connection
            .create_channel()
            .await
            .map_err(|e| HutchError::check_failed(target, e))
    }
}

async fn release(channel: Arc<dyn BrokerChannel>) {
    // Already closed by the broker after a failed passive declare
    if let Err(e) = channel.close().await {
        debug!("Closing check channel failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::testing::MockBroker;
    use crate::transport::{ExchangeKind, QueueOptions};

    fn checker(broker: &MockBroker) -> Checker {
        Checker::new(SessionManager::new(
            "amqp://mock",
            ConnectionConfig::default(),
            Arc::new(broker.clone()),
        ))
    }

    #[tokio::test]
    async fn test_queue_info_counts() {
        let broker = MockBroker::new();
        broker.declare_queue("orders", QueueOptions::durable());
        broker.deliver("orders", b"a");
        broker.deliver("orders", b"b");

        let info = checker(&broker).queue_info("orders").await.unwrap();
        assert_eq!(info.message_count, 2);
        assert_eq!(info.consumer_count, 0);
    }

    #[tokio::test]
    async fn test_missing_queue_is_check_failed() {
        let broker = MockBroker::new();
        let checker = checker(&broker);

        let err = checker.queue_info("missing").await.unwrap_err();
        match err {
            HutchError::CheckFailed { target, .. } => assert_eq!(target, "missing"),
            other => panic!("unexpected error: {:?}", other),
        }

        // The shared session channel survives the failed lookup
        assert!(checker.session.is_healthy());
        assert!(checker.session.current_channel().is_some());
    }

    #[tokio::test]
    async fn test_exchange_exists() {
        let broker = MockBroker::new();
        broker.declare_exchange("events", ExchangeKind::Fanout, true);
        let checker = checker(&broker);

        assert!(checker.exchange_exists("events").await.unwrap());
        assert!(!checker.exchange_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_check_failed() {
        let broker = MockBroker::new();
        broker.fail_next_connects(1);

        let err = checker(&broker).exchange_exists("events").await.unwrap_err();
        assert!(matches!(err, HutchError::CheckFailed { .. }));
        assert_eq!(broker.connect_count(), 1);
    }
}

//! Delivery targets and idempotent declaration
//!
//! Every publish or consume names one [`Target`]. Declaring it is safe to
//! repeat: the broker treats an identical declaration as a no-op, while a
//! declaration that conflicts with an existing resource is reported as
//! [`HutchError::Configuration`] and never retried.

use crate::core::errors::{HutchError, Result};
use crate::transport::{BrokerChannel, ExchangeKind, QueueOptions};
use std::fmt;

/// Destination of a publish or source of a consume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Durable queue addressed through the default exchange
    Queue(String),
    /// Durable direct exchange and routing key
    ///
    /// Consuming from it binds a server-named exclusive queue.
    ExchangeRoute { exchange: String, routing_key: String },
    /// Durable queue bound to a durable direct exchange
    Both {
        exchange: String,
        queue: String,
        routing_key: String,
    },
}

impl Target {
    pub fn queue(name: impl Into<String>) -> Self {
        Target::Queue(name.into())
    }

    pub fn exchange_route(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Target::ExchangeRoute {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn both(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Target::Both {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Build a target from an optional queue and an optional exchange route
    ///
    /// Returns `None` when neither is given.
    pub fn resolve(queue: Option<&str>, route: Option<(&str, &str)>) -> Option<Self> {
        match (queue, route) {
            (Some(q), None) => Some(Target::queue(q)),
            (None, Some((ex, rk))) => Some(Target::exchange_route(ex, rk)),
            (Some(q), Some((ex, rk))) => Some(Target::both(ex, q, rk)),
            (None, None) => None,
        }
    }

    /// (exchange, routing key) a publish is sent to
    pub fn publish_route(&self) -> (&str, &str) {
        match self {
            Target::Queue(name) => ("", name.as_str()),
            Target::ExchangeRoute {
                exchange,
                routing_key,
            }
            | Target::Both {
                exchange,
                routing_key,
                ..
            } => (exchange.as_str(), routing_key.as_str()),
        }
    }

    /// Declare everything a publish to this target needs
    pub async fn declare_for_publish(&self, channel: &dyn BrokerChannel) -> Result<()> {
        match self {
            Target::Queue(name) => {
                declare_queue(channel, name).await?;
            }
            Target::ExchangeRoute { exchange, .. } => {
                declare_exchange(channel, exchange).await?;
            }
            Target::Both {
                exchange,
                queue,
                routing_key,
            } => {
                declare_exchange(channel, exchange).await?;
                declare_queue(channel, queue).await?;
                bind(channel, queue, exchange, routing_key).await?;
            }
        }
        Ok(())
    }

    /// Declare everything a consume needs; returns the queue to consume from
    pub async fn declare_for_consume(&self, channel: &dyn BrokerChannel) -> Result<String> {
        match self {
            Target::Queue(name) => {
                declare_queue(channel, name).await?;
                Ok(name.clone())
            }
            Target::ExchangeRoute {
                exchange,
                routing_key,
            } => {
                declare_exchange(channel, exchange).await?;
                let info = channel
                    .assert_queue("", QueueOptions::temporary())
                    .await
                    .map_err(HutchError::from_declare)?;
                bind(channel, &info.name, exchange, routing_key).await?;
                Ok(info.name)
            }
            Target::Both {
                exchange,
                queue,
                routing_key,
            } => {
                declare_exchange(channel, exchange).await?;
                declare_queue(channel, queue).await?;
                bind(channel, queue, exchange, routing_key).await?;
                Ok(queue.clone())
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Queue(name) => write!(f, "queue '{}'", name),
            Target::ExchangeRoute {
                exchange,
                routing_key,
            } => write!(f, "exchange '{}' ({})", exchange, routing_key),
            Target::Both {
                exchange,
                queue,
                routing_key,
            } => write!(f, "queue '{}' via exchange '{}' ({})", queue, exchange, routing_key),
        }
    }
}

async fn declare_queue(channel: &dyn BrokerChannel, name: &str) -> Result<()> {
    channel
        .assert_queue(name, QueueOptions::durable())
        .await
        .map(|_| ())
        .map_err(HutchError::from_declare)
}

async fn declare_exchange(channel: &dyn BrokerChannel, name: &str) -> Result<()> {
    channel
        .assert_exchange(name, ExchangeKind::Direct, true)
        .await
        .map_err(HutchError::from_declare)
}

async fn bind(channel: &dyn BrokerChannel, queue: &str, exchange: &str, key: &str) -> Result<()> {
    channel
        .bind_queue(queue, exchange, key)
        .await
        .map_err(HutchError::from_declare)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use crate::transport::Transport;

    #[test]
    fn test_resolve() {
        assert_eq!(Target::resolve(Some("jobs"), None), Some(Target::queue("jobs")));
        assert_eq!(
            Target::resolve(None, Some(("events", "created"))),
            Some(Target::exchange_route("events", "created"))
        );
        assert_eq!(
            Target::resolve(Some("audit"), Some(("events", "created"))),
            Some(Target::both("events", "audit", "created"))
        );
        assert_eq!(Target::resolve(None, None), None);
    }

    #[test]
    fn test_publish_route() {
        assert_eq!(Target::queue("jobs").publish_route(), ("", "jobs"));
        assert_eq!(
            Target::both("events", "audit", "created").publish_route(),
            ("events", "created")
        );
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = MockBroker::new();
        let ch = broker.connect("amqp://mock").await.unwrap().create_channel().await.unwrap();
        let target = Target::both("events", "audit", "created");

        target.declare_for_publish(ch.as_ref()).await.unwrap();
        target.declare_for_publish(ch.as_ref()).await.unwrap();

        assert_eq!(broker.assert_queue_calls("audit"), 2);
        assert_eq!(broker.bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_declaration_is_configuration_error() {
        let broker = MockBroker::new();
        broker.declare_exchange("events", ExchangeKind::Fanout, true);
        let ch = broker.connect("amqp://mock").await.unwrap().create_channel().await.unwrap();

        let err = Target::exchange_route("events", "created")
            .declare_for_publish(ch.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, HutchError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_exchange_route_consumes_from_server_named_queue() {
        let broker = MockBroker::new();
        let ch = broker.connect("amqp://mock").await.unwrap().create_channel().await.unwrap();

        let queue = Target::exchange_route("events", "created")
            .declare_for_consume(ch.as_ref())
            .await
            .unwrap();
        assert!(queue.starts_with("amq.gen-"));
        assert_eq!(
            broker.bindings(),
            vec![(queue, "events".to_string(), "created".to_string())]
        );
    }
}

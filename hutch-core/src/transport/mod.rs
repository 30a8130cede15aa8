//! Broker transport seam
//!
//! The resilience layer never talks to a wire protocol directly. It drives a
//! broker through three traits:
//! - [`Transport`]: opens connections
//! - [`BrokerConnection`]: creates channels, emits lifecycle events
//! - [`BrokerChannel`]: declare/publish/consume/ack primitives
//!
//! Connections and channels report failures through [`TransportEvent`]s
//! delivered to handlers registered with `on_event`. Handlers are plain
//! synchronous callbacks and may be invoked from any thread.

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Classification of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection could not be opened or was lost
    Connection,
    /// Channel-level failure (channel closed, invalid state)
    Channel,
    /// Declared resource exists with different properties
    PreconditionFailed,
    /// Queue or exchange does not exist
    NotFound,
    /// Broker did not answer in time
    Timeout,
    /// Anything else
    Other,
}

/// Error reported by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connection, message)
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Channel, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::PreconditionFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Lifecycle event emitted by a connection or channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The resource reported an error and is no longer usable
    Error(TransportError),
    /// The resource was closed, optionally because of an error
    Closed(Option<TransportError>),
}

impl TransportEvent {
    /// Error carried by the event, if any
    pub fn error(&self) -> Option<&TransportError> {
        match self {
            TransportEvent::Error(err) => Some(err),
            TransportEvent::Closed(err) => err.as_ref(),
        }
    }
}

/// Callback receiving transport lifecycle events
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Exchange routing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// Properties of a queue declaration
///
/// An empty queue name asks the broker to generate one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared queue (survives broker restarts)
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Non-durable, exclusive, auto-deleted queue
    pub fn temporary() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Queue counters returned by declare and check operations
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used for ack/nack
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Payload interpreted as UTF-8 (lossy)
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Broker-side consumer registration
///
/// The delivery receiver ends when the channel carrying the consumer dies.
#[derive(Debug)]
pub struct ConsumerStream {
    pub tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Entry point of a broker client library
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection to the broker
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// Transport-level connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a multiplexed channel on this connection
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Close the connection
    async fn close(&self) -> Result<(), TransportError>;

    /// Register a lifecycle event handler
    fn on_event(&self, handler: EventHandler);
}

/// Logical channel on which all broker operations are issued
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue; idempotent when properties match
    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError>;

    /// Declare an exchange; idempotent when properties match
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish a message
    ///
    /// `Ok(false)` means the broker did not accept the message (flow control,
    /// negative confirm) and the send may be retried.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<bool, TransportError>;

    /// Start a manual-acknowledgment consumer on a queue
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<ConsumerStream, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Passive queue lookup
    async fn check_queue(&self, name: &str) -> Result<QueueInfo, TransportError>;

    /// Passive exchange lookup
    async fn check_exchange(&self, name: &str) -> Result<(), TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Register a lifecycle event handler
    fn on_event(&self, handler: EventHandler);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_error_accessor() {
        let err = TransportError::connection("socket reset");
        assert_eq!(TransportEvent::Error(err.clone()).error(), Some(&err));
        assert_eq!(TransportEvent::Closed(Some(err.clone())).error(), Some(&err));
        assert_eq!(TransportEvent::Closed(None).error(), None);
    }

    #[test]
    fn test_queue_options_presets() {
        let durable = QueueOptions::durable();
        assert!(durable.durable && !durable.exclusive && !durable.auto_delete);

        let temp = QueueOptions::temporary();
        assert!(!temp.durable && temp.exclusive && temp.auto_delete);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::precondition_failed("inequivalent arg 'durable'");
        assert_eq!(err.kind(), TransportErrorKind::PreconditionFailed);
        assert!(err.to_string().contains("inequivalent arg"));
    }
}

//! AMQP 0-9-1 transport over `lapin`
//!
//! Publisher confirms are enabled on every channel; a broker nack reports the
//! message as not sent. Passive declares back `check_queue` and
//! `check_exchange`. The consumer stream is drained by a task that forwards
//! deliveries into the [`ConsumerStream`] receiver.
//!
//! Channel lifecycle events are synthesized: lapin reports errors per
//! connection, so a connection error is fanned out to its channels, and an
//! operation failing on a closed channel closes it.

use super::{
    BrokerChannel, BrokerConnection, ConsumerStream, Delivery, EventHandler, ExchangeKind,
    QueueInfo, QueueOptions, Transport, TransportError, TransportErrorKind, TransportEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connects with `lapin`
#[derive(Clone, Default)]
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| map_error(&e, TransportErrorKind::Connection))?;

        let shared = Arc::new(ConnectionEvents::default());
        let events = Arc::clone(&shared);
        connection.on_error(move |err| {
            warn!("AMQP connection error: {}", err);
            events.fail(TransportError::connection(err.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            connection,
            events: shared,
        }))
    }
}

/// Event fan-out for one connection and the channels opened on it
#[derive(Default)]
struct ConnectionEvents {
    handlers: Mutex<Vec<EventHandler>>,
    channels: Mutex<Vec<Arc<ChannelEvents>>>,
    closed: AtomicBool,
}

impl ConnectionEvents {
    fn fail(&self, err: TransportError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels {
            channel.close(Some(TransportError::channel(format!(
                "connection lost: {}",
                err.message()
            ))));
        }
        emit(&self.handlers, TransportEvent::Error(err.clone()));
        emit(&self.handlers, TransportEvent::Closed(Some(err)));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels {
            channel.close(None);
        }
        emit(&self.handlers, TransportEvent::Closed(None));
    }
}

#[derive(Default)]
struct ChannelEvents {
    handlers: Mutex<Vec<EventHandler>>,
    closed: AtomicBool,
}

impl ChannelEvents {
    fn close(&self, err: Option<TransportError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        emit(&self.handlers, TransportEvent::Closed(err));
    }
}

fn emit(handlers: &Mutex<Vec<EventHandler>>, event: TransportEvent) {
    let snapshot: Vec<EventHandler> = handlers.lock().clone();
    for handler in snapshot {
        handler(event.clone());
    }
}

struct LapinConnection {
    connection: Connection,
    events: Arc<ConnectionEvents>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| map_error(&e, TransportErrorKind::Channel))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| map_error(&e, TransportErrorKind::Channel))?;

        let events = Arc::new(ChannelEvents::default());
        self.events.channels.lock().push(Arc::clone(&events));

        Ok(Arc::new(LapinChannel { channel, events }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self
            .connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| map_error(&e, TransportErrorKind::Connection));
        self.events.close();
        result
    }

    fn on_event(&self, handler: EventHandler) {
        self.events.handlers.lock().push(handler);
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    events: Arc<ChannelEvents>,
}

impl LapinChannel {
    /// Map a failed operation and close the channel if the broker killed it
    fn fail(&self, err: lapin::Error, fallback: TransportErrorKind) -> TransportError {
        let mapped = map_error(&err, fallback);
        if !self.channel.status().connected() {
            self.events.close(Some(mapped.clone()));
        }
        mapped
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        let declare = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, kind, declare, FieldTable::default())
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<bool, TransportError> {
        let properties = if persistent {
            BasicProperties::default().with_delivery_mode(PERSISTENT)
        } else {
            BasicProperties::default()
        };

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))?;

        let confirmation = confirm
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))?;

        Ok(!confirmation.is_nack())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<ConsumerStream, TransportError> {
        // An empty tag asks the broker to assign one
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))?;

        let tag = consumer.tag().as_str().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Arc::clone(&self.events);
        let stream_tag = tag.clone();

        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let forwarded = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            redelivered: delivery.redelivered,
                            payload: delivery.data,
                        };
                        if tx.send(forwarded).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Consumer {} stream failed: {}", stream_tag, e);
                        events.close(Some(map_error(&e, TransportErrorKind::Channel)));
                        break;
                    }
                }
            }
            debug!("Consumer {} stream ended", stream_tag);
        });

        Ok(ConsumerStream {
            tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo, TransportError> {
        let declare = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))?;

        Ok(QueueInfo {
            name: name.to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn check_exchange(&self, name: &str) -> Result<(), TransportError> {
        let declare = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                declare,
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| self.fail(e, TransportErrorKind::Channel))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| map_error(&e, TransportErrorKind::Channel))
        } else {
            Err(TransportError::channel("channel already closed"))
        };
        self.events.close(None);
        result
    }

    fn on_event(&self, handler: EventHandler) {
        self.events.handlers.lock().push(handler);
    }
}

/// Classify a lapin error; `fallback` applies to anything not recognized
fn map_error(err: &lapin::Error, fallback: TransportErrorKind) -> TransportError {
    let kind = match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                TransportErrorKind::PreconditionFailed
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => TransportErrorKind::NotFound,
            AMQPErrorKind::Soft(_) => TransportErrorKind::Channel,
            AMQPErrorKind::Hard(_) => TransportErrorKind::Connection,
        },
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportErrorKind::Connection
        }
        lapin::Error::InvalidChannelState(_) => TransportErrorKind::Channel,
        _ => fallback,
    };
    TransportError::new(kind, err.to_string())
}

//! In-memory broker for testing
//!
//! Implements [`Transport`] with a programmable broker: connect, channel,
//! publish and probe failures can be scripted ahead of time, connection
//! drops and channel errors can be injected at any point, and every broker
//! call is recorded for assertions.
//!
//! Routing follows the AMQP basics the resilience layer relies on: the
//! default exchange routes by queue name, other exchanges route through
//! bindings. Exclusive queues die with their connection. Nacked messages
//! are recorded but never redelivered.

use crate::transport::{
    BrokerChannel, BrokerConnection, ConsumerStream, Delivery, EventHandler, ExchangeKind,
    QueueInfo, QueueOptions, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Scripted result of one `publish` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the broker
    Sent,
    /// Not accepted (flow control); `publish` returns `Ok(false)`
    NotSent,
    /// Transport failure; `publish` returns an error
    Fail,
}

/// A message accepted by the mock broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
}

struct MockQueue {
    options: QueueOptions,
    owner: Option<u64>,
    backlog: VecDeque<Vec<u8>>,
}

struct ConsumerEntry {
    tag: String,
    queue: String,
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Script {
    fail_connects: u32,
    fail_channels: u32,
    fail_probes: u32,
    publishes: VecDeque<PublishOutcome>,
}

#[derive(Default)]
struct Record {
    connects: u32,
    channels: u32,
    probes: u32,
    assert_queue: HashMap<String, u32>,
    consumes: HashMap<String, u32>,
    publish_attempts: u32,
    published: Vec<PublishedMessage>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    cancelled: Vec<String>,
}

#[derive(Default)]
struct World {
    script: Script,
    record: Record,
    queues: HashMap<String, MockQueue>,
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    bindings: Vec<(String, String, String)>,
    consumers: Vec<ConsumerEntry>,
    connections: Vec<Arc<MockConnection>>,
}

struct Shared {
    world: Mutex<World>,
    next_id: AtomicU64,
    next_delivery_tag: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Scriptable in-memory transport
#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                world: Mutex::new(World::default()),
                next_id: AtomicU64::new(0),
                next_delivery_tag: AtomicU64::new(0),
            }),
        }
    }

    // ===== SCRIPTING =====

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.world.lock().script.fail_connects = n;
    }

    /// Fail the next `n` channel creations
    pub fn fail_next_channels(&self, n: u32) {
        self.shared.world.lock().script.fail_channels = n;
    }

    /// Fail the next `n` server-named queue declarations (health probes)
    pub fn fail_next_probes(&self, n: u32) {
        self.shared.world.lock().script.fail_probes = n;
    }

    /// Outcomes for upcoming publishes, in order; afterwards publishes succeed
    pub fn script_publishes(&self, outcomes: impl IntoIterator<Item = PublishOutcome>) {
        self.shared.world.lock().script.publishes.extend(outcomes);
    }

    /// Pre-declare a queue, e.g. to provoke a property conflict
    pub fn declare_queue(&self, name: &str, options: QueueOptions) {
        self.shared.world.lock().queues.insert(
            name.to_string(),
            MockQueue {
                options,
                owner: None,
                backlog: VecDeque::new(),
            },
        );
    }

    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) {
        self.shared
            .world
            .lock()
            .exchanges
            .insert(name.to_string(), (kind, durable));
    }

    // ===== FAULT INJECTION =====

    /// Sever every open connection as a network failure would
    pub fn drop_connection(&self) {
        let connections: Vec<Arc<MockConnection>> =
            std::mem::take(&mut self.shared.world.lock().connections);

        for conn in connections {
            conn.shutdown(Some(TransportError::connection("connection reset by peer")));
        }
    }

    /// Break the most recently opened channel with a channel-level error
    pub fn channel_error(&self, message: &str) {
        let connections: Vec<Arc<MockConnection>> = self.shared.world.lock().connections.clone();
        let mut channel = None;
        for conn in connections.iter().rev() {
            let channels = conn.channels.lock();
            if let Some(ch) = channels.iter().rev().find(|ch| !ch.is_closed()) {
                channel = Some(Arc::clone(ch));
                break;
            }
        }

        if let Some(channel) = channel {
            channel.shutdown();
            channel.emit(TransportEvent::Error(TransportError::channel(message)));
        }
    }

    /// Deliver a message straight to a queue
    ///
    /// Returns the delivery tag when a consumer received it, `None` when the
    /// message was parked in the queue backlog.
    pub fn deliver(&self, queue: &str, payload: &[u8]) -> Option<u64> {
        let mut world = self.shared.world.lock();
        self.route_to_queue(&mut world, queue, payload.to_vec())
    }

    fn route_to_queue(&self, world: &mut World, queue: &str, payload: Vec<u8>) -> Option<u64> {
        let mut payload = payload;
        while let Some(idx) = world.consumers.iter().position(|c| c.queue == queue) {
            let tag = self.shared.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: String::new(),
                routing_key: queue.to_string(),
                redelivered: false,
                payload,
            };
            match world.consumers[idx].tx.send(delivery) {
                Ok(()) => return Some(tag),
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver gone; forget the consumer and try the next one
                    world.consumers.remove(idx);
                    payload = returned.payload;
                }
            }
        }

        if let Some(q) = world.queues.get_mut(queue) {
            q.backlog.push_back(payload);
        }
        None
    }

    // ===== RECORDED CALLS =====

    pub fn connect_count(&self) -> u32 {
        self.shared.world.lock().record.connects
    }

    pub fn channel_count(&self) -> u32 {
        self.shared.world.lock().record.channels
    }

    /// Health probes seen (server-named queue declarations)
    pub fn probe_count(&self) -> u32 {
        self.shared.world.lock().record.probes
    }

    pub fn assert_queue_calls(&self, name: &str) -> u32 {
        self.shared
            .world
            .lock()
            .record
            .assert_queue
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn consume_calls(&self, queue: &str) -> u32 {
        self.shared
            .world
            .lock()
            .record
            .consumes
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    /// Publish calls of any outcome
    pub fn publish_attempts(&self) -> u32 {
        self.shared.world.lock().record.publish_attempts
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.world.lock().record.published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.shared.world.lock().record.acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.shared.world.lock().record.nacks.clone()
    }

    pub fn cancelled_tags(&self) -> Vec<String> {
        self.shared.world.lock().record.cancelled.clone()
    }

    /// Tags of the live consumers on `queue`
    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.shared
            .world
            .lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && !c.tx.is_closed())
            .map(|c| c.tag.clone())
            .collect()
    }

    pub fn queue_count(&self) -> usize {
        self.shared.world.lock().queues.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.world.lock().queues.contains_key(name)
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.shared.world.lock().bindings.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.shared
            .world
            .lock()
            .connections
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut world = self.shared.world.lock();
        world.record.connects += 1;

        if world.script.fail_connects > 0 {
            world.script.fail_connects -= 1;
            return Err(TransportError::connection("connection refused"));
        }

        let conn = Arc::new(MockConnection {
            id: self.shared.next_id(),
            broker: self.clone(),
            closed: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        });
        world.connections.push(Arc::clone(&conn));
        Ok(conn)
    }
}

fn emit_to(handlers: &Mutex<Vec<EventHandler>>, event: TransportEvent) {
    let handlers: Vec<EventHandler> = handlers.lock().clone();
    for handler in handlers {
        handler(event.clone());
    }
}

struct MockConnection {
    id: u64,
    broker: MockBroker,
    closed: AtomicBool,
    handlers: Mutex<Vec<EventHandler>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockConnection {
    /// Close this connection, its channels and its exclusive queues
    fn shutdown(&self, cause: Option<TransportError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let channels: Vec<Arc<MockChannel>> = self.channels.lock().drain(..).collect();
        for channel in &channels {
            channel.shutdown();
        }

        {
            let mut world = self.broker.shared.world.lock();
            world.queues.retain(|_, q| q.owner != Some(self.id));
            world.connections.retain(|c| c.id != self.id);
        }

        for channel in &channels {
            channel.emit(TransportEvent::Closed(cause.clone()));
        }
        if let Some(err) = cause.clone() {
            emit_to(&self.handlers, TransportEvent::Error(err));
        }
        emit_to(&self.handlers, TransportEvent::Closed(cause));
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::connection("connection is closed"));
        }

        {
            let mut world = self.broker.shared.world.lock();
            world.record.channels += 1;
            if world.script.fail_channels > 0 {
                world.script.fail_channels -= 1;
                return Err(TransportError::channel("channel open refused"));
            }
        }

        let channel = Arc::new(MockChannel {
            id: self.broker.shared.next_id(),
            connection_id: self.id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::connection("connection already closed"));
        }
        self.shutdown(None);
        Ok(())
    }

    fn on_event(&self, handler: EventHandler) {
        self.handlers.lock().push(handler);
    }
}

struct MockChannel {
    id: u64,
    connection_id: u64,
    broker: MockBroker,
    closed: AtomicBool,
    handlers: Mutex<Vec<EventHandler>>,
}

impl MockChannel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed and end the streams of consumers on this channel
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut world = self.broker.shared.world.lock();
        world.consumers.retain(|c| c.channel_id != self.id);
    }

    fn emit(&self, event: TransportEvent) {
        emit_to(&self.handlers, event);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::channel("channel is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        self.ensure_open()?;
        let shared = &self.broker.shared;
        let mut world = shared.world.lock();
        *world.record.assert_queue.entry(name.to_string()).or_default() += 1;

        let name = if name.is_empty() {
            world.record.probes += 1;
            if world.script.fail_probes > 0 {
                world.script.fail_probes -= 1;
                return Err(TransportError::channel("declare of temporary queue failed"));
            }
            format!("amq.gen-{}", shared.next_id())
        } else {
            name.to_string()
        };

        let owner = options.exclusive.then_some(self.connection_id);
        let queue = world.queues.entry(name.clone()).or_insert_with(|| MockQueue {
            options,
            owner,
            backlog: VecDeque::new(),
        });

        if queue.options != options {
            return Err(TransportError::precondition_failed(format!(
                "inequivalent arguments for queue '{}'",
                name
            )));
        }

        let message_count = queue.backlog.len() as u32;
        let consumer_count = world.consumers.iter().filter(|c| c.queue == name).count() as u32;
        Ok(QueueInfo {
            name,
            message_count,
            consumer_count,
        })
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut world = self.broker.shared.world.lock();
        let existing = *world
            .exchanges
            .entry(name.to_string())
            .or_insert((kind, durable));

        if existing != (kind, durable) {
            return Err(TransportError::precondition_failed(format!(
                "inequivalent arguments for exchange '{}'",
                name
            )));
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut world = self.broker.shared.world.lock();
        if !world.queues.contains_key(queue) {
            return Err(TransportError::not_found(format!("no queue '{}'", queue)));
        }
        if !world.exchanges.contains_key(exchange) {
            return Err(TransportError::not_found(format!("no exchange '{}'", exchange)));
        }

        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if !world.bindings.contains(&binding) {
            world.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let mut world = self.broker.shared.world.lock();
        world.record.publish_attempts += 1;

        match world.script.publishes.pop_front().unwrap_or(PublishOutcome::Sent) {
            PublishOutcome::Fail => return Err(TransportError::channel("publish failed")),
            PublishOutcome::NotSent => return Ok(false),
            PublishOutcome::Sent => {}
        }

        world.record.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            persistent,
        });

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let fanout = matches!(world.exchanges.get(exchange), Some((ExchangeKind::Fanout, _)));
            world
                .bindings
                .iter()
                .filter(|(_, ex, rk)| ex == exchange && (fanout || rk == routing_key))
                .map(|(q, _, _)| q.clone())
                .collect()
        };

        for queue in targets {
            self.broker.route_to_queue(&mut world, &queue, payload.to_vec());
        }
        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<ConsumerStream, TransportError> {
        self.ensure_open()?;
        let shared = &self.broker.shared;
        let mut world = shared.world.lock();
        *world.record.consumes.entry(queue.to_string()).or_default() += 1;

        let backlog: Vec<Vec<u8>> = match world.queues.get_mut(queue) {
            Some(q) => q.backlog.drain(..).collect(),
            None => return Err(TransportError::not_found(format!("no queue '{}'", queue))),
        };

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", shared.next_id())
        } else {
            consumer_tag.to_string()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        world.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            queue: queue.to_string(),
            channel_id: self.id,
            tx,
        });

        for payload in backlog {
            self.broker.route_to_queue(&mut world, queue, payload);
        }

        Ok(ConsumerStream {
            tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut world = self.broker.shared.world.lock();
        world.record.cancelled.push(consumer_tag.to_string());
        world.consumers.retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.shared.world.lock().record.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker
            .shared
            .world
            .lock()
            .record
            .nacks
            .push((delivery_tag, requeue));
        Ok(())
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo, TransportError> {
        self.ensure_open()?;
        let world = self.broker.shared.world.lock();
        let queue = world
            .queues
            .get(name)
            .ok_or_else(|| TransportError::not_found(format!("no queue '{}'", name)))?;

        Ok(QueueInfo {
            name: name.to_string(),
            message_count: queue.backlog.len() as u32,
            consumer_count: world.consumers.iter().filter(|c| c.queue == name).count() as u32,
        })
    }

    async fn check_exchange(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.broker.shared.world.lock().exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(TransportError::not_found(format!("no exchange '{}'", name)))
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut world = self.broker.shared.world.lock();
        world.queues.remove(name);
        world.consumers.retain(|c| c.queue != name);
        world.bindings.retain(|(q, _, _)| q != name);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::channel("channel already closed"));
        }
        self.shutdown();
        self.emit(TransportEvent::Closed(None));
        Ok(())
    }

    fn on_event(&self, handler: EventHandler) {
        self.handlers.lock().push(handler);
    }
}

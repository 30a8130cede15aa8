//! Reconnecting consumer
//!
//! `subscribe` declares the target and starts a manual-ack consumer. Each
//! delivery is handed to the application handler in its own task: success
//! is acked, an error or a panic is nacked with requeue so the broker
//! redelivers the message.
//!
//! Subscriptions outlive sessions. Every lost session wakes a single
//! resubscribe worker, which waits a fixed delay and restores all
//! subscriptions, retrying until it succeeds or the session manager closes.
//! Re-subscribing a target replaces its tracked consumer tag.

use super::target::Target;
use crate::config::HutchConfig;
use crate::connection::{ListenerId, SessionManager};
use crate::core::errors::{HutchError, Result};
use crate::monitoring::ServiceMonitor;
use crate::transport::{BrokerChannel, Delivery};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Application callback for consumed messages
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one delivery; an error requeues the message
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        (self.0)(delivery.clone()).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
pub struct ReconnectingConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    session: SessionManager,
    resubscribe_delay: Duration,
    tag_prefix: Option<String>,
    next_tag: AtomicU64,
    /// Target → broker consumer tag of its live consumer
    active: DashMap<Target, String>,
    subscriptions: DashMap<Target, Arc<dyn MessageHandler>>,
    resubscribe: Arc<Notify>,
    listener: Mutex<Option<ListenerId>>,
    monitor: Mutex<Option<ServiceMonitor>>,
}

impl ReconnectingConsumer {
    pub fn new(session: SessionManager, resubscribe_delay: Duration) -> Self {
        Self::build(session, resubscribe_delay, None)
    }

    pub fn from_config(session: SessionManager, config: &HutchConfig) -> Self {
        let prefix = Some(config.broker.consumer_tag.clone()).filter(|p| !p.is_empty());
        Self::build(session, config.consumer.resubscribe_delay(), prefix)
    }

    /// Report processed messages and handler failures into `monitor`
    pub fn with_monitor(self, monitor: ServiceMonitor) -> Self {
        *self.inner.monitor.lock() = Some(monitor);
        self
    }

    fn build(
        session: SessionManager,
        resubscribe_delay: Duration,
        tag_prefix: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                session,
                resubscribe_delay,
                tag_prefix,
                next_tag: AtomicU64::new(0),
                active: DashMap::new(),
                subscriptions: DashMap::new(),
                resubscribe: Arc::new(Notify::new()),
                listener: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Start consuming `target`; returns the broker consumer tag
    ///
    /// The subscription is restored automatically after every lost session.
    pub async fn subscribe(&self, target: Target, handler: Arc<dyn MessageHandler>) -> Result<String> {
        self.inner.ensure_started();
        self.inner
            .subscriptions
            .insert(target.clone(), Arc::clone(&handler));

        match self.inner.start(&target, handler).await {
            Ok(tag) => Ok(tag),
            Err(e) => {
                self.inner.subscriptions.remove(&target);
                Err(e)
            }
        }
    }

    /// Stop consuming `target` and forget the subscription
    pub async fn unsubscribe(&self, target: &Target) -> Result<()> {
        self.inner.subscriptions.remove(target);
        let Some((_, tag)) = self.inner.active.remove(target) else {
            return Ok(());
        };

        if let Some(channel) = self.inner.session.current_channel() {
            channel.cancel(&tag).await?;
        }
        info!("Unsubscribed from {} (consumer tag {})", target, tag);
        Ok(())
    }

    /// Tracked consumer tag for `target`
    pub fn consumer_tag(&self, target: &Target) -> Option<String> {
        self.inner.active.get(target).map(|tag| tag.value().clone())
    }

    pub fn active_consumers(&self) -> Vec<(Target, String)> {
        self.inner
            .active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

impl ConsumerInner {
    /// Register the disconnection listener and the resubscribe worker once
    fn ensure_started(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }

        let notify = Arc::clone(&self.resubscribe);
        let id = self.session.on_disconnected(move |err| {
            match err {
                Some(e) => info!("Session lost ({}), scheduling resubscription", e),
                None => info!("Session lost, scheduling resubscription"),
            }
            notify.notify_one();
        });
        *listener = Some(id);

        tokio::spawn(resubscribe_worker(
            Arc::downgrade(self),
            Arc::clone(&self.resubscribe),
            self.session.cancellation_token(),
        ));
    }

    fn consumer_tag(&self) -> String {
        match &self.tag_prefix {
            Some(prefix) => format!(
                "{}-{}",
                prefix,
                self.next_tag.fetch_add(1, Ordering::Relaxed) + 1
            ),
            // Broker assigns one
            None => String::new(),
        }
    }

    async fn start(&self, target: &Target, handler: Arc<dyn MessageHandler>) -> Result<String> {
        let timeout = self.session.config().connection_timeout();
        let (_, channel) = self.session.acquire(timeout).await?;

        let queue = target.declare_for_consume(channel.as_ref()).await?;
        let stream = channel.consume(&queue, &self.consumer_tag()).await?;
        let tag = stream.tag.clone();

        if let Some(old) = self.active.insert(target.clone(), tag.clone()) {
            if old != tag {
                // The old consumer usually died with its channel
                if let Err(e) = channel.cancel(&old).await {
                    debug!("Cancel of previous consumer {} failed: {}", old, e);
                }
            }
        }

        info!("Consuming from {} (consumer tag {})", target, tag);

        tokio::spawn(process_deliveries(
            channel,
            stream.deliveries,
            handler,
            self.monitor.lock().clone(),
            self.session.cancellation_token(),
            target.to_string(),
        ));

        Ok(tag)
    }

    /// Restore every subscription
    async fn resubscribe_all(&self) -> Result<()> {
        let subscriptions: Vec<(Target, Arc<dyn MessageHandler>)> = self
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (target, handler) in subscriptions {
            info!("Resubscribing to {}", target);
            match self.start(&target, handler).await {
                Ok(_) => {}
                Err(HutchError::Configuration(reason)) => {
                    error!("Dropping subscription to {}: {}", target, reason);
                    self.subscriptions.remove(&target);
                    self.active.remove(&target);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        if let Some(id) = self.listener.get_mut().take() {
            self.session.remove_listener(id);
        }
    }
}

async fn resubscribe_worker(
    inner: Weak<ConsumerInner>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = notify.notified() => {}
            _ = cancel.cancelled() => break,
        }

        loop {
            let Some(delay) = inner.upgrade().map(|i| i.resubscribe_delay) else {
                return;
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }

            let Some(consumer) = inner.upgrade() else {
                return;
            };

            match consumer.resubscribe_all().await {
                Ok(()) => break,
                Err(HutchError::Closed) => return,
                Err(e) => warn!("Resubscription failed, retrying in {:?}: {}", delay, e),
            }
        }
    }

    debug!("Resubscribe worker stopped");
}

/// Run the handler for each delivery and settle it with ack or nack
async fn process_deliveries(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
    monitor: Option<ServiceMonitor>,
    cancel: CancellationToken,
    source: String,
) {
    loop {
        let delivery = tokio::select! {
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let delivery_tag = delivery.delivery_tag;
        let task_handler = Arc::clone(&handler);

        // A panicking handler surfaces as a JoinError instead of killing the loop
        let outcome = tokio::spawn(async move { task_handler.handle(&delivery).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(HutchError::ConsumerCallback(format!("{:#}", e))),
            Err(join_err) => Some(HutchError::ConsumerCallback(format!(
                "handler panicked: {}",
                join_err
            ))),
        };

        match failure {
            None => match channel.ack(delivery_tag).await {
                Ok(()) => {
                    if let Some(monitor) = &monitor {
                        monitor.record_message_processed();
                    }
                }
                Err(e) => warn!("Failed to ack message {} from {}: {}", delivery_tag, source, e),
            },
            Some(err) => {
                warn!(
                    "Message {} from {} rejected, requeueing: {}",
                    delivery_tag, source, err
                );
                if let Some(monitor) = &monitor {
                    monitor.record_error("handler");
                }
                if let Err(e) = channel.nack(delivery_tag, true).await {
                    warn!("Failed to nack message {} from {}: {}", delivery_tag, source, e);
                }
            }
        }
    }

    debug!("Delivery stream for {} ended", source);
}

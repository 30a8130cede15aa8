//! Connection session manager
//!
//! Owns the single broker session (connection + channel) and keeps it
//! alive:
//!
//! - `ensure_session` runs the connect sequence, serialized by an async
//!   mutex so concurrent callers share one attempt
//! - transport events are forwarded into an mpsc queue drained by a
//!   supervisor task, which demotes the session and starts reconnection
//! - a health monitor probes the session periodically
//! - listeners are told about every established and every lost session
//!
//! Callers only ever receive handles of a healthy session. `close()` is
//! terminal: it cancels every background task and later operations fail
//! with [`HutchError::Closed`].

use super::listeners::{ListenerId, ListenerRegistry};
use crate::config::{ConnectionConfig, HutchConfig};
use crate::core::connection_fsm::{ConnectionSnapshot, SessionState, StaleHandles};
use crate::core::errors::{HutchError, Result};
use crate::resilience::backoff::linear_delay;
use crate::resilience::health::{run_health_monitor, HealthTarget};
use crate::resilience::reconnect::{
    run_reconnect_loop, ReconnectOutcome, ReconnectPolicy, Reconnectable,
};
use crate::transport::{
    BrokerChannel, BrokerConnection, EventHandler, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A healthy (connection, channel) pair
pub type Session = (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>);

type EventReceiver = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

/// Handle to the shared session; clones refer to the same session
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    connect_lock: tokio::sync::Mutex<()>,
    listeners: ListenerRegistry,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    events_rx: Mutex<Option<EventReceiver>>,
    health_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks_started: AtomicBool,
    self_ref: Weak<Inner>,
}

impl SessionManager {
    /// Create a manager; nothing connects until the first `ensure_session`
    pub fn new(
        url: impl Into<String>,
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (health_tx, _) = watch::channel(false);
        let url = url.into();

        let inner = Arc::new_cyclic(|self_ref| Inner {
            url,
            config,
            transport,
            state: Mutex::new(SessionState::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            listeners: ListenerRegistry::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            health_tx,
            cancel: CancellationToken::new(),
            tasks_started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        Self { inner }
    }

    pub fn from_config(config: &HutchConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(config.broker.url.clone(), config.connection.clone(), transport)
    }

    /// Return the healthy session, running the connect sequence if needed
    pub async fn ensure_session(&self) -> Result<Session> {
        self.inner.ensure_session().await
    }

    /// Session for an operation
    ///
    /// Uses the healthy session if there is one, waits up to `timeout` for a
    /// running reconnection loop, and otherwise connects itself.
    pub async fn acquire(&self, timeout: Duration) -> Result<Session> {
        if let Some(session) = self.inner.healthy_session()? {
            return Ok(session);
        }

        let reconnecting = self.inner.state.lock().is_connecting();
        if reconnecting {
            self.wait_for_healthy(timeout).await?;
            if let Some(session) = self.inner.healthy_session()? {
                return Ok(session);
            }
        }

        self.inner.ensure_session().await
    }

    /// Channel of the healthy session, never a stale one
    pub fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner.state.lock().healthy_handles().map(|(_, ch)| ch)
    }

    /// Wait until the session is healthy
    pub async fn wait_for_healthy(&self, timeout: Duration) -> Result<()> {
        if self.inner.state.lock().is_closed() {
            return Err(HutchError::Closed);
        }

        let mut health_rx = self.inner.health_tx.subscribe();
        let wait = async move { health_rx.wait_for(|healthy| *healthy).await.map(|_| ()) };

        tokio::select! {
            result = tokio::time::timeout(timeout, wait) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(HutchError::Closed),
                Err(_) => Err(HutchError::ConnectionTimeout(timeout)),
            },
            _ = self.inner.cancel.cancelled() => Err(HutchError::Closed),
        }
    }

    /// Close channel then connection and stop all background work
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let stale = self.inner.state.lock().mark_closed();
        self.inner.health_tx.send_replace(false);
        close_stale(stale).await;
        info!("Session manager closed");
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.state.lock().snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.state.lock().is_healthy()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().is_closed()
    }

    /// Register a callback for every newly established session
    pub fn on_connected<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.listeners.add_connected(Arc::new(listener))
    }

    /// Register a callback for every lost session
    pub fn on_disconnected<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&HutchError>) + Send + Sync + 'static,
    {
        self.inner.listeners.add_disconnected(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Token cancelled by `close()`
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl Inner {
    fn healthy_session(&self) -> Result<Option<Session>> {
        let state = self.state.lock();
        if state.is_closed() {
            return Err(HutchError::Closed);
        }
        Ok(state.healthy_handles())
    }

    async fn ensure_session(&self) -> Result<Session> {
        if let Some(session) = self.healthy_session()? {
            return Ok(session);
        }

        self.start_background_tasks();

        let _connect_guard = tokio::select! {
            guard = self.connect_lock.lock() => guard,
            _ = self.cancel.cancelled() => return Err(HutchError::Closed),
        };

        // Another caller may have connected while we waited for the lock
        if let Some(session) = self.healthy_session()? {
            return Ok(session);
        }

        let (generation, stale) = self.state.lock().begin_connect();
        self.health_tx.send_replace(false);
        close_stale(stale).await;

        info!("Connecting to broker (session {})", generation);

        let connection = match self.open_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                self.state.lock().mark_connect_failed(generation, e.to_string());
                return Err(e);
            }
        };
        connection.on_event(self.event_handler(generation));

        let channel = match self.create_channel(&connection).await {
            Ok(ch) => ch,
            Err(e) => {
                error!("Channel creation failed, keeping connection: {}", e);
                let mut state = self.state.lock();
                state.park_connection(generation, connection);
                state.mark_connect_failed(generation, e.to_string());
                return Err(e);
            }
        };
        channel.on_event(self.event_handler(generation));

        let marked = self.state.lock().mark_healthy(
            generation,
            Arc::clone(&connection),
            Arc::clone(&channel),
        );
        if let Err(stale) = marked {
            // Closed while connecting
            close_stale(stale).await;
            return Err(HutchError::Closed);
        }

        self.health_tx.send_replace(true);
        info!("Broker session {} established", generation);
        self.listeners.fire_connected();

        Ok((connection, channel))
    }

    async fn open_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let timeout = self.config.connection_timeout();
        tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.connect(&self.url)) => match result {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(HutchError::Connection(format!("connect failed: {}", e))),
                Err(_) => Err(HutchError::Connection(format!("connect timed out after {:?}", timeout))),
            },
            _ = self.cancel.cancelled() => Err(HutchError::Closed),
        }
    }

    /// Create a channel, retrying with linear backoff
    async fn create_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<Arc<dyn BrokerChannel>> {
        let max_retries = self.config.channel_max_retries.max(1);
        let mut last_error: Option<TransportError> = None;

        for attempt in 1..=max_retries {
            match connection.create_channel().await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    warn!(
                        "Channel creation attempt {}/{} failed: {}",
                        attempt, max_retries, e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_retries {
                let delay = linear_delay(self.config.channel_retry_delay(), attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => return Err(HutchError::Closed),
                }
            }
        }

        Err(HutchError::Connection(format!(
            "channel creation failed after {} attempts: {}",
            max_retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn event_handler(&self, generation: u64) -> EventHandler {
        let tx = self.events_tx.clone();
        Arc::new(move |event| {
            // Receiver only goes away with the manager
            let _ = tx.send((generation, event));
        })
    }

    fn start_background_tasks(&self) {
        if self.tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(events_rx) = self.events_rx.lock().take() {
            tokio::spawn(supervise(self.self_ref.clone(), events_rx, self.cancel.clone()));
        }

        tokio::spawn(run_health_monitor(
            self.self_ref.clone(),
            self.config.health_check_interval(),
            self.cancel.clone(),
        ));
    }

    /// Demote the session of `generation` and start reconnecting
    fn handle_loss(&self, generation: u64, err: Option<HutchError>) {
        let lost = self
            .state
            .lock()
            .mark_lost(generation, err.as_ref().map(|e| e.to_string()));
        if !lost {
            debug!("Ignoring event for inactive session {}", generation);
            return;
        }

        match &err {
            Some(e) => warn!("Broker session {} lost: {}", generation, e),
            None => warn!("Broker session {} closed", generation),
        }

        self.health_tx.send_replace(false);
        self.listeners.fire_disconnected(err.as_ref());
        self.trigger_reconnect();
    }

    fn trigger_reconnect(&self) {
        if !self.state.lock().try_begin_reconnect() {
            debug!("Reconnection already in progress");
            return;
        }

        let handle = ReconnectHandle(self.self_ref.clone());
        let policy = ReconnectPolicy::from_config(&self.config);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let outcome = run_reconnect_loop(&handle, &policy, &cancel).await;
                if outcome == ReconnectOutcome::Cancelled {
                    debug!("Reconnection loop cancelled");
                }
                let released = match handle.0.upgrade() {
                    Some(inner) => inner.state.lock().end_reconnect(),
                    None => true,
                };
                // A loss between recovery and release found the claim taken
                if released || cancel.is_cancelled() {
                    break;
                }
                warn!("Session lost while reconnection was finishing, reconnecting again");
            }
        });
    }
}

#[async_trait]
impl HealthTarget for Inner {
    fn probe_channel(&self) -> Option<(u64, Arc<dyn BrokerChannel>)> {
        let state = self.state.lock();
        state
            .healthy_handles()
            .map(|(_, channel)| (state.generation(), channel))
    }

    async fn probe_failed(&self, generation: u64, err: TransportError) {
        self.handle_loss(generation, Some(HutchError::Transport(err)));
    }
}

/// Reconnection target that does not keep the manager alive
struct ReconnectHandle(Weak<Inner>);

#[async_trait]
impl Reconnectable for ReconnectHandle {
    async fn attempt(&self) -> Result<()> {
        let inner = self.0.upgrade().ok_or(HutchError::Closed)?;
        inner.ensure_session().await.map(|_| ())
    }

    fn is_healthy(&self) -> bool {
        self.0
            .upgrade()
            .map(|inner| inner.state.lock().is_healthy())
            .unwrap_or(false)
    }

    fn attempts(&self) -> u32 {
        self.0
            .upgrade()
            .map(|inner| inner.state.lock().reconnect_attempts())
            .unwrap_or(0)
    }

    fn record_failure(&self, err: &HutchError) -> u32 {
        self.0
            .upgrade()
            .map(|inner| inner.state.lock().record_reconnect_failure(err.to_string()))
            .unwrap_or(0)
    }

    fn reset_attempts(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.state.lock().reset_reconnect_attempts();
        }
    }
}

/// Drain transport events until the manager is closed or dropped
async fn supervise(inner: Weak<Inner>, mut events_rx: EventReceiver, cancel: CancellationToken) {
    loop {
        let (generation, event) = tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_loss(generation, event.error().cloned().map(HutchError::Transport));
    }

    debug!("Session supervisor stopped");
}

/// Best-effort close, channel first
async fn close_stale(stale: StaleHandles) {
    if let Some(channel) = stale.channel {
        if let Err(e) = channel.close().await {
            debug!("Error closing stale channel: {}", e);
        }
    }
    if let Some(connection) = stale.connection {
        if let Err(e) = connection.close().await {
            debug!("Error closing stale connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection_fsm::SessionPhase;
    use crate::testing::MockBroker;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 1_000,
            health_check_interval_ms: 10_000,
            channel_max_retries: 3,
            channel_retry_delay_ms: 50,
            connection_timeout_ms: 500,
            jitter_window_ms: 0,
        }
    }

    fn manager(broker: &MockBroker) -> SessionManager {
        SessionManager::new("amqp://mock", fast_config(), Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_ensure_session_connects_once() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);
        let connected = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&connected);
        mgr.on_connected(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(mgr.current_channel().is_none());
        mgr.ensure_session().await.unwrap();
        mgr.ensure_session().await.unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert!(mgr.current_channel().is_some());

        let snap = mgr.snapshot();
        assert_eq!(snap.phase, SessionPhase::Healthy);
        assert!(snap.has_connection && snap.has_channel);
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connect() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);

        let (a, b, c) = tokio::join!(
            mgr.ensure_session(),
            mgr.ensure_session(),
            mgr.ensure_session()
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_retry_then_success() {
        let broker = MockBroker::new();
        broker.fail_next_channels(2);
        let mgr = manager(&broker);

        mgr.ensure_session().await.unwrap();
        assert_eq!(broker.channel_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_exhaustion_keeps_connection() {
        let broker = MockBroker::new();
        broker.fail_next_channels(3);
        let mgr = manager(&broker);

        let Err(err) = mgr.ensure_session().await else {
            panic!("expected ensure_session to fail");
        };
        assert!(matches!(err, HutchError::Connection(_)));

        let snap = mgr.snapshot();
        assert!(!snap.is_healthy);
        assert!(snap.has_connection);
        assert!(!snap.has_channel);
        assert!(snap.last_error.is_some());
        assert!(mgr.current_channel().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_triggers_single_disconnect_and_reconnect() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);
        let disconnects = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&disconnects);
        mgr.on_disconnected(move |err| {
            assert!(err.is_some());
            d.fetch_add(1, Ordering::SeqCst);
        });

        mgr.ensure_session().await.unwrap();
        broker.drop_connection();

        // Connection and channel both report; only one loss is counted
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!mgr.is_healthy());
        assert!(mgr.current_channel().is_none());

        mgr.wait_for_healthy(Duration::from_secs(5)).await.unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connect_count(), 2);
        assert!(mgr.snapshot().generation >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_counts_failures_then_resets() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);
        mgr.ensure_session().await.unwrap();

        broker.fail_next_connects(2);
        broker.drop_connection();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let snap = mgr.snapshot();
        assert!(snap.is_connecting);
        assert!(snap.reconnect_attempts >= 1);

        mgr.wait_for_healthy(Duration::from_secs(5)).await.unwrap();
        // Let the loop release its claim
        tokio::task::yield_now().await;
        let snap = mgr.snapshot();
        assert!(snap.is_healthy);
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_healthy_times_out() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);

        let err = mgr
            .wait_for_healthy(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, HutchError::ConnectionTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reconnects() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);
        let disconnects = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&disconnects);
        mgr.on_disconnected(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        mgr.ensure_session().await.unwrap();
        broker.fail_next_probes(1);

        // First probe fires after one interval
        tokio::time::sleep(Duration::from_millis(10_050)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        mgr.wait_for_healthy(Duration::from_secs(5)).await.unwrap();
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);
        mgr.ensure_session().await.unwrap();

        mgr.close().await;

        assert!(mgr.is_closed());
        assert!(mgr.current_channel().is_none());
        assert_eq!(broker.open_connections(), 0);
        assert!(matches!(mgr.ensure_session().await, Err(HutchError::Closed)));
        assert!(matches!(
            mgr.wait_for_healthy(Duration::from_secs(1)).await,
            Err(HutchError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_reconnection() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);
        mgr.ensure_session().await.unwrap();

        broker.fail_next_connects(u32::MAX);
        broker.drop_connection();
        tokio::time::sleep(Duration::from_millis(500)).await;

        mgr.close().await;
        let connects = broker.connect_count();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.connect_count(), connects);
    }

    #[tokio::test]
    async fn test_acquire_connects_when_idle() {
        let broker = MockBroker::new();
        let mgr = manager(&broker);

        mgr.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(mgr.is_healthy());
    }
}

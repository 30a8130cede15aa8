//! Service-level health and counters
//!
//! [`ServiceMonitor`] follows the session through connect/disconnect
//! listeners, counts message flow reported by the publisher and consumer,
//! and classifies overall health:
//!
//! - `Unhealthy`: the broker session is not healthy
//! - `Degraded`: a reconnection cycle has failed attempts, or too many errors
//! - `Healthy`: otherwise
//!
//! Every counter is mirrored into a Prometheus [`MetricsRegistry`].

use super::metrics::MetricsRegistry;
use crate::config::constants::DEGRADED_ERROR_THRESHOLD;
use crate::connection::SessionManager;
use crate::core::connection_fsm::ConnectionSnapshot;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitState, CircuitStats};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Overall service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Counters and uptimes, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceMetrics {
    pub uptime_ms: u64,
    pub connection_uptime_ms: u64,
    pub messages_processed: u64,
    pub messages_published: u64,
    pub errors: u64,
    pub reconnection_count: u64,
    /// Unix timestamp (ms) of the last re-established session
    pub last_reconnection_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedCircuit {
    pub name: String,
    #[serde(flatten)]
    pub stats: CircuitStats,
}

/// Everything an external health check needs
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub metrics: ServiceMetrics,
    pub connection: ConnectionSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub circuit_breakers: Vec<NamedCircuit>,
}

/// Health classification from the session snapshot and the error count
pub fn classify(snapshot: &ConnectionSnapshot, errors: u64) -> (HealthStatus, Option<String>) {
    if !snapshot.is_healthy {
        let reason = match &snapshot.last_error {
            Some(e) => format!("no broker session: {}", e),
            None => "no broker session".to_string(),
        };
        return (HealthStatus::Unhealthy, Some(reason));
    }

    if snapshot.reconnect_attempts > 0 {
        return (
            HealthStatus::Degraded,
            Some(format!("{} failed reconnect attempts", snapshot.reconnect_attempts)),
        );
    }

    if errors > DEGRADED_ERROR_THRESHOLD {
        return (HealthStatus::Degraded, Some(format!("{} errors", errors)));
    }

    (HealthStatus::Healthy, None)
}

#[derive(Default)]
struct ConnectionTimes {
    connected_since: Option<Instant>,
    ever_connected: bool,
    last_reconnection: Option<SystemTime>,
}

struct MonitorInner {
    session: SessionManager,
    metrics: MetricsRegistry,
    started_at: Instant,
    times: Mutex<ConnectionTimes>,
    processed: AtomicU64,
    published: AtomicU64,
    errors: AtomicU64,
    reconnections: AtomicU64,
    breakers: Mutex<Vec<CircuitBreaker>>,
}

/// Shared service monitor; clones report into the same counters
#[derive(Clone)]
pub struct ServiceMonitor {
    inner: Arc<MonitorInner>,
}

impl ServiceMonitor {
    /// Create a monitor attached to `session`
    pub fn new(session: SessionManager) -> Result<Self, prometheus::Error> {
        let inner = Arc::new(MonitorInner {
            session: session.clone(),
            metrics: MetricsRegistry::new()?,
            started_at: Instant::now(),
            times: Mutex::new(ConnectionTimes::default()),
            processed: AtomicU64::new(0),
            published: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            breakers: Mutex::new(Vec::new()),
        });

        // A session that is already up counts as the first connection
        if session.is_healthy() {
            let mut times = inner.times.lock();
            times.connected_since = Some(Instant::now());
            times.ever_connected = true;
        }

        let weak: Weak<MonitorInner> = Arc::downgrade(&inner);
        session.on_connected(move || {
            if let Some(inner) = weak.upgrade() {
                inner.connection_established();
            }
        });

        let weak: Weak<MonitorInner> = Arc::downgrade(&inner);
        session.on_disconnected(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.times.lock().connected_since = None;
            }
        });

        Ok(Self { inner })
    }

    pub fn record_message_processed(&self) {
        self.inner.processed.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.messaging().messages_processed_total.inc();
    }

    pub fn record_message_published(&self) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.messaging().messages_published_total.inc();
    }

    pub fn record_publish_retry(&self) {
        self.inner.metrics.messaging().publish_retries_total.inc();
    }

    /// Count an error of `kind` (e.g. "publish", "handler")
    pub fn record_error(&self, kind: &str) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .messaging()
            .errors_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Include a circuit breaker in health reports and metrics
    pub fn watch_breaker(&self, breaker: CircuitBreaker) {
        self.inner.breakers.lock().push(breaker);
    }

    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    pub fn session(&self) -> &SessionManager {
        &self.inner.session
    }

    pub fn metrics(&self) -> ServiceMetrics {
        let times = self.inner.times.lock();
        ServiceMetrics {
            uptime_ms: millis(self.inner.started_at.elapsed()),
            connection_uptime_ms: times
                .connected_since
                .map(|t| millis(t.elapsed()))
                .unwrap_or(0),
            messages_processed: self.inner.processed.load(Ordering::Relaxed),
            messages_published: self.inner.published.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            reconnection_count: self.inner.reconnections.load(Ordering::Relaxed),
            last_reconnection_ms: times.last_reconnection.and_then(|t| {
                t.duration_since(UNIX_EPOCH).ok().map(millis)
            }),
        }
    }

    pub fn health(&self) -> HealthReport {
        let connection = self.inner.session.snapshot();
        let metrics = self.metrics();
        let (status, reason) = classify(&connection, metrics.errors);

        let circuit_breakers = self
            .inner
            .breakers
            .lock()
            .iter()
            .map(|b| NamedCircuit {
                name: b.name().to_string(),
                stats: b.stats(),
            })
            .collect();

        HealthReport {
            status,
            reason,
            metrics,
            connection,
            circuit_breakers,
        }
    }

    /// Refresh gauges from current state (before a scrape)
    pub fn sync_metrics(&self) {
        let snapshot = self.inner.session.snapshot();
        let metrics = self.metrics();
        let connection = self.inner.metrics.connection();

        connection.healthy.set(i64::from(snapshot.is_healthy));
        connection
            .reconnect_attempts
            .set(i64::from(snapshot.reconnect_attempts));
        connection
            .connection_uptime_seconds
            .set(metrics.connection_uptime_ms as f64 / 1000.0);
        connection
            .uptime_seconds
            .set((metrics.uptime_ms / 1000) as i64);

        for breaker in self.inner.breakers.lock().iter() {
            let value = match breaker.state() {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            connection
                .circuit_breaker_state
                .with_label_values(&[breaker.name()])
                .set(value);
        }
    }

    /// Log the health report and the metrics on their own periods
    ///
    /// Stops when the session manager is closed.
    pub fn spawn_reporter(
        &self,
        health_interval: Duration,
        metrics_interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        let cancel = self.inner.session.cancellation_token();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut health_tick = tokio::time::interval_at(start + health_interval, health_interval);
            let mut metrics_tick =
                tokio::time::interval_at(start + metrics_interval, metrics_interval);
            health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = health_tick.tick() => monitor.log_health(),
                    _ = metrics_tick.tick() => monitor.log_metrics(),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    fn log_health(&self) {
        let report = self.health();
        let details = serde_json::to_string(&report).unwrap_or_default();
        match report.status {
            HealthStatus::Healthy => info!(status = "healthy", "Health check: {}", details),
            HealthStatus::Degraded => warn!(status = "degraded", "Health check: {}", details),
            HealthStatus::Unhealthy => error!(status = "unhealthy", "Health check: {}", details),
        }
    }

    fn log_metrics(&self) {
        self.sync_metrics();
        let metrics = self.metrics();
        info!(
            uptime_ms = metrics.uptime_ms,
            connection_uptime_ms = metrics.connection_uptime_ms,
            processed = metrics.messages_processed,
            published = metrics.messages_published,
            errors = metrics.errors,
            reconnections = metrics.reconnection_count,
            "Service metrics"
        );
    }
}

impl MonitorInner {
    fn connection_established(&self) {
        let mut times = self.times.lock();
        times.connected_since = Some(Instant::now());

        if times.ever_connected {
            times.last_reconnection = Some(SystemTime::now());
            self.reconnections.fetch_add(1, Ordering::Relaxed);
            self.metrics.connection().reconnections_total.inc();
        }
        times.ever_connected = true;
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

//! Prometheus metrics for the resilience layer
//!
//! Two metric families:
//! - Messaging (published, processed, errors, publish retries)
//! - Connection (health, reconnects, uptimes, circuit breaker states)

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tracing::info;

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    messaging: Arc<MessagingMetrics>,
    connection: Arc<ConnectionMetrics>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metric families
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let messaging = Arc::new(MessagingMetrics::new(&registry)?);
        let connection = Arc::new(ConnectionMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            messaging,
            connection,
        })
    }

    /// Get the underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn messaging(&self) -> &MessagingMetrics {
        &self.messaging
    }

    pub fn connection(&self) -> &ConnectionMetrics {
        &self.connection
    }
}

/// Message flow metrics
pub struct MessagingMetrics {
    /// Messages handled and acknowledged
    pub messages_processed_total: IntCounter,
    /// Messages accepted by the broker
    pub messages_published_total: IntCounter,
    /// Failures by kind (publish, handler, ...)
    pub errors_total: IntCounterVec,
    /// Publish attempts that were retried
    pub publish_retries_total: IntCounter,
}

impl MessagingMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages_processed_total = IntCounter::new(
            "hutch_messages_processed_total",
            "Total number of consumed messages handled successfully",
        )?;
        registry.register(Box::new(messages_processed_total.clone()))?;

        let messages_published_total = IntCounter::new(
            "hutch_messages_published_total",
            "Total number of messages accepted by the broker",
        )?;
        registry.register(Box::new(messages_published_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Total number of errors by kind").namespace("hutch"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let publish_retries_total = IntCounter::new(
            "hutch_publish_retries_total",
            "Total number of retried publish attempts",
        )?;
        registry.register(Box::new(publish_retries_total.clone()))?;

        Ok(Self {
            messages_processed_total,
            messages_published_total,
            errors_total,
            publish_retries_total,
        })
    }
}

/// Session and circuit breaker metrics
pub struct ConnectionMetrics {
    /// 1 if the session is healthy, 0 otherwise
    pub healthy: IntGauge,
    /// Failed attempts in the running reconnection cycle
    pub reconnect_attempts: IntGauge,
    /// Sessions re-established after a loss
    pub reconnections_total: IntCounter,
    /// Seconds since the session became healthy
    pub connection_uptime_seconds: Gauge,
    /// Seconds since the service started
    pub uptime_seconds: IntGauge,
    /// Breaker state by name (0 = closed, 1 = half-open, 2 = open)
    pub circuit_breaker_state: IntGaugeVec,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let healthy = IntGauge::new(
            "hutch_connection_healthy",
            "Broker session health (1 = healthy, 0 = unhealthy)",
        )?;
        registry.register(Box::new(healthy.clone()))?;

        let reconnect_attempts = IntGauge::new(
            "hutch_connection_reconnect_attempts",
            "Failed attempts in the current reconnection cycle",
        )?;
        registry.register(Box::new(reconnect_attempts.clone()))?;

        let reconnections_total = IntCounter::new(
            "hutch_connection_reconnections_total",
            "Total number of re-established sessions",
        )?;
        registry.register(Box::new(reconnections_total.clone()))?;

        let connection_uptime_seconds = Gauge::new(
            "hutch_connection_uptime_seconds",
            "Seconds since the session became healthy",
        )?;
        registry.register(Box::new(connection_uptime_seconds.clone()))?;

        let uptime_seconds =
            IntGauge::new("hutch_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)",
            )
            .namespace("hutch"),
            &["name"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            healthy,
            reconnect_attempts,
            reconnections_total,
            connection_uptime_seconds,
            uptime_seconds,
            circuit_breaker_state,
        })
    }
}

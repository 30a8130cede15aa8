//! Hutch Service - resilient consumer
//!
//! Connects to the broker, consumes the configured target and keeps doing so
//! across connection losses:
//! - every delivery runs through a circuit breaker; failures are requeued
//! - health is logged periodically and exported over HTTP with the metrics
//! - Ctrl+C closes the session and exits

use anyhow::{Context, Result};
use clap::Parser;
use hutch_bins::common::{init_logging, redact_url, CommonArgs};
use hutch_core::monitoring::{MetricsServer, MetricsServerConfig};
use hutch_core::prelude::*;
use hutch_core::transport::amqp::LapinTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resilient AMQP consumer service")]
struct ServiceArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Consume from this queue only, without exchange binding
    #[arg(long)]
    queue_only: bool,

    /// Do not start the metrics HTTP server
    #[arg(long)]
    no_metrics_server: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServiceArgs::parse();
    let config = args.common.load_config()?;
    init_logging(&config)?;

    info!("=== Hutch Service ===");
    info!("Broker: {}", redact_url(&config.broker.url));

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    let session = SessionManager::from_config(&config, Arc::new(LapinTransport::new()));
    session.on_connected(|| info!("Connected to broker"));
    session.on_disconnected(|err| match err {
        Some(e) => warn!("Disconnected from broker: {}", e),
        None => warn!("Disconnected from broker"),
    });

    let monitor = ServiceMonitor::new(session.clone()).context("Failed to register metrics")?;
    let breaker = CircuitBreaker::new(
        "message_handler",
        config.circuit_breaker.breaker_config(),
    );
    monitor.watch_breaker(breaker.clone());

    let reporter = monitor.spawn_reporter(
        config.monitoring.health_report_interval(),
        config.monitoring.metrics_report_interval(),
    );

    let server = if args.no_metrics_server {
        None
    } else {
        let server_config = MetricsServerConfig::from_config(&config.monitoring)?;
        let server = MetricsServer::new(server_config, monitor.clone());
        Some(tokio::spawn(server.serve(session.cancellation_token())))
    };

    let target = if args.queue_only {
        Target::queue(&config.broker.queue)
    } else {
        Target::both(
            &config.broker.exchange,
            &config.broker.queue,
            &config.broker.routing_key,
        )
    };

    let consumer =
        ReconnectingConsumer::from_config(session.clone(), &config).with_monitor(monitor.clone());
    let handler = handler_fn(move |delivery: Delivery| {
        let breaker = breaker.clone();
        async move {
            breaker
                .execute(|| process(delivery))
                .await
                .map_err(|e| match e {
                    CircuitError::Inner(inner) => inner,
                    CircuitError::Open { retry_in } => {
                        anyhow::anyhow!("handler circuit open, retry in {:?}", retry_in)
                    }
                    CircuitError::Timeout(after) => {
                        anyhow::anyhow!("handler timed out after {:?}", after)
                    }
                })
        }
    });

    let retry_delay = config.connection.reconnect_backoff().base_delay;
    let subscribed = tokio::select! {
        result = subscribe_until_ready(&consumer, &target, handler, retry_delay) => Some(result),
        _ = shutdown_rx.recv() => None,
    };

    match subscribed {
        Some(Ok(tag)) => {
            info!("Service running (consumer tag {}), press Ctrl+C to stop", tag);
            let _ = shutdown_rx.recv().await;
        }
        Some(Err(e)) => error!("Failed to start consumer: {}", e),
        None => {}
    }

    info!("Shutting down");
    session.close().await;

    let _ = reporter.await;
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => error!("Metrics server failed: {}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    info!("Final counters: {}", final_summary(&monitor));
    Ok(())
}

/// Keep trying the first subscription until the broker is reachable
///
/// Later losses are handled by the consumer itself.
async fn subscribe_until_ready(
    consumer: &ReconnectingConsumer,
    target: &Target,
    handler: Arc<dyn MessageHandler>,
    retry_delay: Duration,
) -> hutch_core::Result<String> {
    loop {
        match consumer.subscribe(target.clone(), Arc::clone(&handler)).await {
            Ok(tag) => return Ok(tag),
            Err(e) if e.is_retryable() => {
                warn!("Subscribe to {} failed, retrying in {:?}: {}", target, retry_delay, e);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn process(delivery: Delivery) -> anyhow::Result<()> {
    let body = delivery.payload_str();
    if body.trim().is_empty() {
        anyhow::bail!("empty message (delivery tag {})", delivery.delivery_tag);
    }

    info!(
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "Received: {}",
        body
    );
    Ok(())
}

fn final_summary(monitor: &ServiceMonitor) -> String {
    let metrics = monitor.metrics();
    format!(
        "processed={} published={} errors={} reconnections={}",
        metrics.messages_processed,
        metrics.messages_published,
        metrics.errors,
        metrics.reconnection_count
    )
}

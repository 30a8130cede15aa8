//! Outage Simulation Example
//!
//! Runs the whole resilience layer against the in-memory broker:
//! - consumer and publisher sharing one managed session
//! - a simulated network failure and the automatic recovery
//! - the health report and Prometheus metrics before and after
//!
//! ```text
//! cargo run -p hutch-core --example outage_simulation
//! ```

use hutch_core::prelude::*;
use hutch_core::testing::{MockBroker, PublishOutcome};
use hutch_core::utils::init_logger;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger("info", false)?;

    let mut config = HutchConfig::default();
    config.connection.reconnect_delay_ms = 500;
    config.consumer.resubscribe_delay_ms = 1_000;

    let broker = MockBroker::new();
    let session = SessionManager::from_config(&config, Arc::new(broker.clone()));
    let monitor = ServiceMonitor::new(session.clone())?;

    // ===================================================================
    // STEP 1: Consume and publish on a healthy session
    // ===================================================================
    println!("Step 1: healthy session");

    let consumer =
        ReconnectingConsumer::from_config(session.clone(), &config).with_monitor(monitor.clone());
    let publisher =
        RetryingPublisher::from_config(session.clone(), &config).with_monitor(monitor.clone());
    let target = Target::queue(&config.broker.queue);

    consumer
        .subscribe(
            target.clone(),
            handler_fn(|delivery: Delivery| async move {
                println!("   received: {}", delivery.payload_str());
                Ok(())
            }),
        )
        .await?;
    publisher.publish(&target, b"before the outage").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_health(&monitor);

    // ===================================================================
    // STEP 2: Lose the connection, keep publishing
    // ===================================================================
    println!("\nStep 2: connection reset, one flaky publish");

    broker.script_publishes([PublishOutcome::NotSent]);
    broker.drop_connection();
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_health(&monitor);

    publisher.publish(&target, b"during recovery").await?;

    // ===================================================================
    // STEP 3: Session and subscription are back
    // ===================================================================
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    println!("\nStep 3: recovered");
    publisher.publish(&target, b"after the outage").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_health(&monitor);

    monitor.sync_metrics();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&monitor.metrics_registry().registry().gather(), &mut buffer)?;
    println!("\nMetrics:\n{}", String::from_utf8_lossy(&buffer));

    session.close().await;
    Ok(())
}

fn print_health(monitor: &ServiceMonitor) {
    let report = monitor.health();
    println!(
        "   health: {:?} (session {}, reconnect attempts {})",
        report.status, report.connection.generation, report.connection.reconnect_attempts
    );
}

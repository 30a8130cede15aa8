//! Circuit breaker guarding consumer handlers and publishes

use hutch_core::prelude::*;
use hutch_core::resilience::CircuitState;
use hutch_core::testing::MockBroker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
    CircuitBreaker::new(
        "handler",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            operation_timeout: Duration::from_secs(5),
            reset_timeout: reset,
        },
    )
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_threshold_failures_then_fail_fast_until_reset() {
    let breaker = breaker(3, Duration::from_secs(10));
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Shed without invoking the operation
    for _ in 0..5 {
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.stats().total_rejections, 5);

    // Half-open probe succeeds and closes the circuit
    tokio::time::sleep(Duration::from_millis(10_001)).await;
    breaker
        .execute(|| async { Ok::<_, &str>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_operation_counts_as_failure() {
    let breaker = CircuitBreaker::new(
        "slow",
        CircuitBreakerConfig {
            failure_threshold: 1,
            operation_timeout: Duration::from_millis(100),
            reset_timeout: Duration::from_secs(30),
        },
    );

    let result = breaker
        .execute(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, HutchError>(())
        })
        .await;

    assert!(matches!(result, Err(CircuitError::Timeout(_))));
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_guarded_handler_sheds_and_requeues() {
    let broker = MockBroker::new();
    let config = HutchConfig::default();
    let session = SessionManager::from_config(&config, Arc::new(broker.clone()));
    let monitor = ServiceMonitor::new(session.clone()).unwrap();
    let consumer =
        ReconnectingConsumer::from_config(session.clone(), &config).with_monitor(monitor.clone());

    let guard = breaker(2, Duration::from_secs(30));
    monitor.watch_breaker(guard.clone());

    let invoked = Arc::new(AtomicUsize::new(0));
    let handler = {
        let guard = guard.clone();
        let invoked = Arc::clone(&invoked);
        handler_fn(move |_delivery: Delivery| {
            let guard = guard.clone();
            let invoked = Arc::clone(&invoked);
            async move {
                guard
                    .execute(|| async {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
                    })
                    .await
                    .map_err(|e| match e {
                        CircuitError::Inner(inner) => inner,
                        other => anyhow::anyhow!("{:?}", other),
                    })
            }
        })
    };

    consumer
        .subscribe(Target::queue("jobs"), handler)
        .await
        .unwrap();

    for i in 0..4u8 {
        broker.deliver("jobs", &[i]).unwrap();
        settle().await;
    }

    // Two real failures trip the breaker, the rest are shed
    assert_eq!(invoked.load(Ordering::SeqCst), 2);
    assert_eq!(broker.nacks().len(), 4);
    assert!(broker.nacks().iter().all(|(_, requeue)| *requeue));
    assert!(broker.acks().is_empty());

    let report = monitor.health();
    assert_eq!(report.circuit_breakers.len(), 1);
    assert_eq!(report.circuit_breakers[0].stats.state, CircuitState::Open);
    assert_eq!(report.metrics.errors, 4);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_does_not_consume_publish_budget() {
    let broker = MockBroker::new();
    broker.script_publishes([hutch_core::testing::PublishOutcome::Fail; 1]);
    let config = HutchConfig::default();
    let session = SessionManager::from_config(&config, Arc::new(broker.clone()));
    let publisher = RetryingPublisher::from_config(session, &config);
    let guard = breaker(1, Duration::from_secs(60));

    // Publish succeeds on its second attempt; the breaker only sees the outcome
    publisher
        .publish_guarded(&guard, &Target::queue("orders"), b"1")
        .await
        .unwrap();
    assert_eq!(guard.state(), CircuitState::Closed);
    assert_eq!(broker.publish_attempts(), 2);

    guard
        .execute(|| async { Err::<(), _>(()) })
        .await
        .unwrap_err();
    let err = publisher
        .publish_guarded(&guard, &Target::queue("orders"), b"2")
        .await
        .unwrap_err();
    assert!(matches!(err, HutchError::CircuitOpen { .. }));
    assert_eq!(broker.publish_attempts(), 2);
}

//! Session manager lifecycle: liveness, listeners, health and the
//! healthy-implies-handles invariant under random fault sequences

use hutch_core::config::ConnectionConfig;
use hutch_core::prelude::*;
use hutch_core::testing::MockBroker;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        max_reconnect_attempts: 3,
        reconnect_delay_ms: 100,
        max_reconnect_delay_ms: 1_000,
        health_check_interval_ms: 5_000,
        channel_max_retries: 2,
        channel_retry_delay_ms: 50,
        connection_timeout_ms: 500,
        jitter_window_ms: 0,
    }
}

fn manager(broker: &MockBroker) -> SessionManager {
    SessionManager::new("amqp://mock", fast_config(), Arc::new(broker.clone()))
}

fn assert_invariant(snapshot: &ConnectionSnapshot) {
    if snapshot.is_healthy {
        assert!(snapshot.has_connection, "healthy without connection: {:?}", snapshot);
        assert!(snapshot.has_channel, "healthy without channel: {:?}", snapshot);
    }
    assert_eq!(snapshot.is_healthy, snapshot.phase == SessionPhase::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_survives_exhausted_cycles() {
    let broker = MockBroker::new();
    let session = manager(&broker);
    session.ensure_session().await.unwrap();

    // More failures than one cycle allows
    broker.fail_next_connects(5);
    broker.drop_connection();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!session.is_healthy());

    session
        .wait_for_healthy(Duration::from_secs(30))
        .await
        .unwrap();

    let snapshot = session.snapshot();
    assert!(snapshot.is_healthy);
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(broker.connect_count(), 1 + 5 + 1);
}

#[tokio::test(start_paused = true)]
async fn test_listeners_see_every_transition() {
    let broker = MockBroker::new();
    let session = manager(&broker);

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&connected);
    let d = Arc::clone(&disconnected);
    session.on_connected(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    let id = session.on_disconnected(move |err| {
        assert!(err.is_some());
        d.fetch_add(1, Ordering::SeqCst);
    });

    session.ensure_session().await.unwrap();
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    // Connection error and close events for one loss notify once
    broker.drop_connection();
    tokio::time::sleep(Duration::from_millis(10)).await;
    session
        .wait_for_healthy(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(connected.load(Ordering::SeqCst), 2);

    assert!(session.remove_listener(id));
    broker.channel_error("PRECONDITION_FAILED");
    tokio::time::sleep(Duration::from_millis(10)).await;
    session
        .wait_for_healthy(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(connected.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_demotes_and_recovers() {
    let broker = MockBroker::new();
    let session = manager(&broker);
    session.ensure_session().await.unwrap();
    let generation = session.snapshot().generation;

    broker.fail_next_probes(1);
    tokio::time::sleep(Duration::from_millis(5_010)).await;
    assert!(broker.probe_count() >= 1);

    session
        .wait_for_healthy(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(session.snapshot().generation > generation);
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_health_follows_session() {
    let broker = MockBroker::new();
    let session = manager(&broker);
    let monitor = ServiceMonitor::new(session.clone()).unwrap();

    assert_eq!(monitor.health().status, HealthStatus::Unhealthy);

    session.ensure_session().await.unwrap();
    assert_eq!(monitor.health().status, HealthStatus::Healthy);

    broker.fail_next_connects(1);
    broker.drop_connection();
    tokio::time::sleep(Duration::from_millis(150)).await;
    // First reconnect attempt failed, the second is pending
    assert_eq!(monitor.health().status, HealthStatus::Unhealthy);
    assert_eq!(session.snapshot().reconnect_attempts, 1);

    session
        .wait_for_healthy(Duration::from_secs(5))
        .await
        .unwrap();
    let report = monitor.health();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.metrics.reconnection_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_is_terminal_for_every_operation() {
    let broker = MockBroker::new();
    let session = manager(&broker);
    session.ensure_session().await.unwrap();

    session.close().await;

    assert!(session.is_closed());
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(session.ensure_session().await, Err(HutchError::Closed)));
    assert!(matches!(
        session.wait_for_healthy(Duration::from_secs(1)).await,
        Err(HutchError::Closed)
    ));
    assert!(session.current_channel().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loss_while_reconnect_finishes_recovers() {
    let broker = MockBroker::new();
    let session = manager(&broker);

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&connected);
    let b = broker.clone();
    session.on_connected(move || {
        if c.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            // Drop the fresh session while this listener holds up the loop
            let b = b.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                b.drop_connection();
            });
            std::thread::sleep(Duration::from_millis(200));
        }
    });
    let d = Arc::clone(&disconnected);
    session.on_disconnected(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    session.ensure_session().await.unwrap();
    broker.drop_connection();

    tokio::time::sleep(Duration::from_millis(500)).await;
    session
        .wait_for_healthy(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(disconnected.load(Ordering::SeqCst), 2);
    assert_eq!(connected.load(Ordering::SeqCst), 3);
    assert_eq!(broker.connect_count(), 3);
    assert_invariant(&session.snapshot());
    session.close().await;
}

#[derive(Debug, Clone)]
enum Op {
    Ensure,
    Drop,
    ChannelError,
    FailConnects(u32),
    FailChannels(u32),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Ensure),
        2 => Just(Op::Drop),
        2 => Just(Op::ChannelError),
        1 => (1u32..4).prop_map(Op::FailConnects),
        1 => (1u32..3).prop_map(Op::FailChannels),
        3 => (1u64..2_000).prop_map(Op::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_healthy_implies_handles(ops in prop::collection::vec(op(), 1..30)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async move {
            let broker = MockBroker::new();
            let session = manager(&broker);

            for op in ops {
                match op {
                    Op::Ensure => {
                        let _ = session.ensure_session().await;
                    }
                    Op::Drop => broker.drop_connection(),
                    Op::ChannelError => broker.channel_error("channel error"),
                    Op::FailConnects(n) => broker.fail_next_connects(n),
                    Op::FailChannels(n) => broker.fail_next_channels(n),
                    Op::Advance(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                }
                tokio::task::yield_now().await;

                let snapshot = session.snapshot();
                assert_invariant(&snapshot);
                assert_eq!(snapshot.is_healthy, session.current_channel().is_some());
            }

            // With faults exhausted the session always comes back
            broker.fail_next_connects(0);
            broker.fail_next_channels(0);
            let _ = session.ensure_session().await;
            session
                .wait_for_healthy(Duration::from_secs(60))
                .await
                .unwrap();
            assert_invariant(&session.snapshot());
            session.close().await;
        });
    }
}

//! Session health monitoring
//!
//! A single task probes the healthy session on a fixed period. The probe
//! declares a disposable server-named queue (non-durable, exclusive,
//! auto-delete) and deletes it again. Probes run sequentially from one
//! loop, so they never overlap, and ticks are skipped while the session is
//! not healthy.

use crate::transport::{BrokerChannel, QueueOptions, TransportError};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Create and delete a temporary queue on `channel`
pub async fn probe_channel(channel: &dyn BrokerChannel) -> Result<(), TransportError> {
    let info = channel.assert_queue("", QueueOptions::temporary()).await?;
    channel.delete_queue(&info.name).await
}

/// Session side of the health monitor
#[async_trait]
pub trait HealthTarget: Send + Sync {
    /// Channel to probe with its session generation; `None` skips the tick
    fn probe_channel(&self) -> Option<(u64, Arc<dyn BrokerChannel>)>;

    /// Called when the probe of `generation` failed
    async fn probe_failed(&self, generation: u64, err: TransportError);
}

/// Probe until cancelled or the target is dropped
pub async fn run_health_monitor<T>(target: Weak<T>, period: Duration, cancel: CancellationToken)
where
    T: HealthTarget + ?Sized,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let Some(target) = target.upgrade() else {
            break;
        };

        let Some((generation, channel)) = target.probe_channel() else {
            continue;
        };

        match probe_channel(channel.as_ref()).await {
            Ok(()) => debug!("Health check passed (session {})", generation),
            Err(e) => {
                warn!("Health check failed (session {}): {}", generation, e);
                target.probe_failed(generation, e).await;
            }
        }
    }

    debug!("Health monitor stopped");
}

//! Periodic expiry sweep over process-local state.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::DeliveryContext;

/// What one sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired edit locks.
    pub locks: usize,
    /// Heartbeat samples past the inactivity threshold.
    pub heartbeats: usize,
    /// Idle per-identity latency aggregates past retention.
    pub heartbeat_metrics: usize,
    /// Idle rate-limit windows.
    pub rate_windows: usize,
    /// Offline queues past retention.
    pub queues: usize,
    /// Presence writes replayed into the backing store.
    pub presence_writes: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Run one sweep.
pub async fn sweep_once(ctx: &DeliveryContext) -> SweepReport {
    SweepReport {
        locks: ctx.conflicts.cleanup(),
        heartbeats: ctx.heartbeats.cleanup(ctx.config.heartbeat_inactivity),
        heartbeat_metrics: ctx.heartbeats.prune_metrics(ctx.config.heartbeat_metrics_retention),
        rate_windows: ctx.limiters.sweep(),
        queues: ctx.queue.purge_expired(),
        presence_writes: ctx.registry.reconcile_presence().await,
    }
}

/// Sweep every `sweep_interval` until `token` is cancelled.
pub fn spawn_sweeper(ctx: Arc<DeliveryContext>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = interval.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    let report = sweep_once(&ctx).await;
                    if !report.is_empty() {
                        debug!(?report, "maintenance sweep");
                    }
                }
            }
        }
        info!("maintenance sweeper stopped");
    })
}

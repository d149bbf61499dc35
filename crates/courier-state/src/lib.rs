//! # courier-state
//!
//! The process- and cluster-level state behind message delivery:
//!
//! - [`rate_limit::RateLimiter`]: sliding-window counters per (identity, event)
//! - [`heartbeat::HeartbeatManager`]: liveness and latency aggregates
//! - [`conflict::ConflictManager`]: time-boxed advisory edit locks
//! - [`presence::PresenceStore`]: identity → live connections, local or Redis
//! - [`queue::OfflineQueue`]: per-recipient message queues, memory or Redis
//!
//! Redis-backed strategies are wrapped in degrading adapters that bound every
//! call with a timeout and fall back to process-local state on failure.

#![deny(unsafe_code)]

pub mod conflict;
pub mod errors;
pub mod heartbeat;
pub mod keys;
pub mod presence;
pub mod queue;
pub mod rate_limit;

pub use conflict::{ConflictManager, EditLock, LockOutcome, UnlockError};
pub use errors::{Result, StateError};
pub use heartbeat::{GlobalStats, HeartbeatManager, LatencyMetrics};
pub use keys::KeySpace;
pub use presence::{DegradingPresence, LocalPresence, PresenceStore, RedisPresence};
pub use queue::{DegradingQueue, MemoryQueue, OfflineQueue, Peeked, QueuedMessage, RedisQueue};
pub use rate_limit::RateLimiter;

use std::future::Future;
use std::time::Duration;

/// Counter incremented whenever a backing store call fails over to local state.
pub const BACKING_STORE_DEGRADED_TOTAL: &str = "backing_store_degraded_total";

/// Run `fut` with an upper bound, mapping elapsed time to [`StateError::Timeout`].
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StateError::Timeout {
            operation,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn bounded_passes_through_fast_results() {
        let v = bounded("op", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out_slow_calls() {
        let result: Result<()> = bounded("slow.op", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_matches!(
            result,
            Err(StateError::Timeout {
                operation: "slow.op",
                timeout_ms: 50
            })
        );
    }
}

//! Dependencies shared by every event handler.

use std::future::Future;
use std::sync::Arc;

use courier_core::{StoreError, Stores};
use courier_state::{ConflictManager, HeartbeatManager, OfflineQueue};
use tracing::warn;

use crate::config::ServerConfig;
use crate::errors::EventError;
use crate::limits::EventLimiters;
use crate::registry::ConnectionRegistry;

/// Shared context passed to every handler.
pub struct DeliveryContext {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Live connections, rooms and presence.
    pub registry: Arc<ConnectionRegistry>,
    /// Persistent collaborators.
    pub stores: Stores,
    /// Offline message queue.
    pub queue: Arc<dyn OfflineQueue>,
    /// Edit locks.
    pub conflicts: ConflictManager,
    /// Liveness and latency aggregates.
    pub heartbeats: HeartbeatManager,
    /// Per-event rate limiters.
    pub limiters: EventLimiters,
}

impl DeliveryContext {
    /// Build the context, wiring a fresh registry over `presence`.
    pub fn new(
        config: Arc<ServerConfig>,
        stores: Stores,
        presence: Arc<dyn courier_state::PresenceStore>,
        queue: Arc<dyn OfflineQueue>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            presence,
            Arc::clone(&stores.conversations),
            config.store_timeout,
        ));
        Self {
            conflicts: ConflictManager::new(config.lock_ttl),
            heartbeats: HeartbeatManager::new(),
            limiters: EventLimiters::new(&config.rate_limits),
            registry,
            stores,
            queue,
            config,
        }
    }

    /// Run a collaborator call under the store timeout.
    pub async fn store_call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, EventError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result.map_err(|error| {
                if !matches!(error, StoreError::NotFound { .. }) {
                    warn!(operation, %error, "store call failed");
                }
                EventError::from(error)
            }),
            Err(_) => {
                warn!(operation, timeout_ms = self.config.store_timeout.as_millis() as u64, "store call timed out");
                Err(EventError::Timeout { operation })
            }
        }
    }
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("node_id", &self.config.node_id)
            .field("registry", &self.registry)
            .field("queue", &self.queue.backend())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use courier_state::{LocalPresence, MemoryQueue};
    use courier_store::MemoryStore;

    pub(crate) fn make_context(store: Arc<MemoryStore>) -> DeliveryContext {
        make_context_with(store, ServerConfig::default())
    }

    pub(crate) fn make_context_with(store: Arc<MemoryStore>, config: ServerConfig) -> DeliveryContext {
        DeliveryContext::new(
            Arc::new(config),
            Stores::from_shared(store),
            Arc::new(LocalPresence::new()),
            Arc::new(MemoryQueue::new(Duration::from_secs(3600))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn store_call_times_out() {
        let ctx = make_context(Arc::new(MemoryStore::new()));
        let result: Result<(), EventError> = ctx
            .store_call("slow", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_matches!(result, Err(EventError::Timeout { operation: "slow" }));
    }

    #[tokio::test]
    async fn store_call_maps_not_found() {
        let ctx = make_context(Arc::new(MemoryStore::new()));
        let result: Result<(), EventError> = ctx
            .store_call("lookup", async { Err(StoreError::not_found("message", "m1")) })
            .await;
        assert_matches!(result, Err(EventError::NotFound(msg)) if msg == "message not found");
    }
}

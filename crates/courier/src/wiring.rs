//! Backend selection: collaborator store, shared state and cluster bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use courier_core::{Stores, UserId};
use courier_server::cluster::{ClusterBus, RedisClusterBus};
use courier_settings::{CourierSettings, StoreBackend};
use courier_state::{
    DegradingPresence, DegradingQueue, KeySpace, LocalPresence, MemoryQueue, OfflineQueue,
    PresenceStore, RedisPresence, RedisQueue,
};
use courier_store::{ConnectionConfig, MemoryStore, SqliteStore};
use redis::aio::ConnectionManager;
use tracing::{info, warn};

/// A user to create at startup, `id` or `id:Display Name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedUser {
    pub id: String,
    pub display_name: String,
}

impl std::str::FromStr for SeedUser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, name) = match s.split_once(':') {
            Some((id, name)) => (id.trim(), name.trim()),
            None => (s.trim(), s.trim()),
        };
        if id.is_empty() {
            return Err("user id must not be empty".into());
        }
        Ok(Self {
            id: id.to_owned(),
            display_name: if name.is_empty() { id } else { name }.to_owned(),
        })
    }
}

/// Open the configured collaborator store and seed `users` as mutual contacts.
pub fn build_stores(settings: &CourierSettings, users: &[SeedUser]) -> Result<Stores> {
    let ids: Vec<UserId> = users.iter().map(|u| UserId::from(u.id.as_str())).collect();
    match settings.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            for user in users {
                let _ = store.add_user(user.id.as_str(), &user.display_name);
            }
            for (i, a) in ids.iter().enumerate() {
                for b in &ids[i + 1..] {
                    store.add_contacts(a, b);
                }
            }
            info!(seeded = users.len(), "using in-memory store");
            Ok(Stores::from_shared(store))
        }
        StoreBackend::Sqlite => {
            let path = &settings.store.sqlite_path;
            let config = ConnectionConfig {
                pool_size: settings.store.pool_size,
                ..ConnectionConfig::default()
            };
            let store = Arc::new(
                SqliteStore::open(path, &config)
                    .with_context(|| format!("Failed to open SQLite store at {path}"))?,
            );
            for user in users {
                let _ = store
                    .add_user(user.id.as_str(), &user.display_name)
                    .with_context(|| format!("Failed to seed user {}", user.id))?;
            }
            for (i, a) in ids.iter().enumerate() {
                for b in &ids[i + 1..] {
                    store
                        .add_contacts(a, b)
                        .with_context(|| format!("Failed to link contacts {a} and {b}"))?;
                }
            }
            info!(path = %path, seeded = users.len(), "using SQLite store");
            Ok(Stores::from_shared(store))
        }
    }
}

/// Shared state strategies for this process.
pub struct Backends {
    pub presence: Arc<dyn PresenceStore>,
    pub queue: Arc<dyn OfflineQueue>,
    pub cluster: Option<Arc<dyn ClusterBus>>,
}

/// Process-local presence and queue.
pub fn local_backends(retention: Duration) -> Backends {
    Backends {
        presence: Arc::new(LocalPresence::new()),
        queue: Arc::new(MemoryQueue::new(retention)),
        cluster: None,
    }
}

/// Redis-backed presence and queue behind degrading wrappers, plus the
/// cluster bus when enabled. An unreachable Redis at startup leaves the
/// process in single-node mode.
pub async fn build_backends(settings: &CourierSettings) -> Result<Backends> {
    let retention = Duration::from_secs(settings.delivery.queue_retention_secs);
    let Some(url) = settings.redis.url.as_deref() else {
        info!("no redis url configured, running single-node");
        return Ok(local_backends(retention));
    };

    let timeout = Duration::from_millis(settings.delivery.store_timeout_ms);
    let client = redis::Client::open(url).context("Invalid redis url")?;
    let manager = match tokio::time::timeout(timeout, ConnectionManager::new(client.clone())).await
    {
        Ok(Ok(manager)) => manager,
        Ok(Err(error)) => {
            warn!(%error, "redis unreachable, falling back to local state");
            return Ok(local_backends(retention));
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "redis connect timed out, falling back to local state");
            return Ok(local_backends(retention));
        }
    };

    let keys = KeySpace::new(settings.redis.key_prefix.clone());
    let presence: Arc<dyn PresenceStore> = Arc::new(DegradingPresence::new(
        Arc::new(RedisPresence::new(manager.clone(), keys.clone())),
        timeout,
    ));
    let queue: Arc<dyn OfflineQueue> = Arc::new(DegradingQueue::new(
        Arc::new(RedisQueue::new(manager.clone(), keys, retention)),
        retention,
        timeout,
    ));
    let cluster: Option<Arc<dyn ClusterBus>> = if settings.redis.cluster_enabled {
        Some(Arc::new(RedisClusterBus::new(
            client,
            manager,
            settings.redis.cluster_channel.clone(),
        )))
    } else {
        None
    };
    info!(clustered = cluster.is_some(), "redis shared state enabled");
    Ok(Backends {
        presence,
        queue,
        cluster,
    })
}

//! Redis and collaborator-store settings.

use serde::{Deserialize, Serialize};

/// Shared state backend. Absent `url` means single-process mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisSettings {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Prefix prepended to every key.
    pub key_prefix: String,
    /// Pub/sub channel carrying cross-process emits.
    pub cluster_channel: String,
    /// Whether emits are bridged to other processes.
    pub cluster_enabled: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: String::new(),
            cluster_channel: "courier:events".to_string(),
            cluster_enabled: true,
        }
    }
}

/// Which reference collaborator store the binary wires in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// SQLite file.
    Sqlite,
}

/// Reference collaborator store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Backend selection.
    pub backend: StoreBackend,
    /// Database path for the SQLite backend.
    pub sqlite_path: String,
    /// Pool size for the SQLite backend.
    pub pool_size: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: "courier.db".to_string(),
            pool_size: 8,
        }
    }
}

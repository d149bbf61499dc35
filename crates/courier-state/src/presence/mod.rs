//! Presence: which identities have at least one live connection.
//!
//! Strategies are chosen at startup behind [`PresenceStore`]:
//!
//! - [`LocalPresence`]: single-process map
//! - [`RedisPresence`]: shared across processes, atomic per identity
//! - [`DegradingPresence`]: bounds a primary with a timeout, answers from a
//!   local mirror when the primary fails and replays missed writes once it
//!   recovers

mod degrading;
mod local;
mod redis_backed;

pub use degrading::DegradingPresence;
pub use local::LocalPresence;
pub use redis_backed::RedisPresence;

use async_trait::async_trait;

use crate::errors::Result;

/// Identity → set of live connection ids.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Short backend name for logs and `/health`.
    fn backend(&self) -> &'static str;

    /// Whether the store is currently answering from a fallback.
    fn is_degraded(&self) -> bool {
        false
    }

    /// Add a connection. Returns `true` when it is the identity's first.
    async fn add_connection(&self, identity: &str, connection: &str) -> Result<bool>;

    /// Remove a connection. Returns `true` when this removed the identity's
    /// last connection. Removing an unknown connection returns `false`.
    async fn remove_connection(&self, identity: &str, connection: &str) -> Result<bool>;

    /// Whether the identity has any live connection.
    async fn is_online(&self, identity: &str) -> Result<bool>;

    /// Every identity with a live connection.
    async fn list_online(&self) -> Result<Vec<String>>;

    /// Re-apply writes that never reached the backing store. Returns how many
    /// were applied.
    async fn reconcile(&self) -> usize {
        0
    }
}

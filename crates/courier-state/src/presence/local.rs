use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::PresenceStore;
use crate::errors::Result;

/// In-process presence map.
///
/// Every mutation happens under one lock, so the empty↔non-empty transition
/// of an identity is observed by exactly one caller.
#[derive(Debug, Default)]
pub struct LocalPresence {
    connections: Mutex<HashMap<String, HashSet<String>>>,
}

impl LocalPresence {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; `true` when it is the identity's first.
    pub fn add(&self, identity: &str, connection: &str) -> bool {
        let mut map = self.connections.lock();
        let set = map.entry(identity.to_owned()).or_default();
        set.insert(connection.to_owned()) && set.len() == 1
    }

    /// Remove a connection; `true` when it was the identity's last.
    pub fn remove(&self, identity: &str, connection: &str) -> bool {
        let mut map = self.connections.lock();
        let Some(set) = map.get_mut(identity) else {
            return false;
        };
        if !set.remove(connection) {
            return false;
        }
        if set.is_empty() {
            let _ = map.remove(identity);
            return true;
        }
        false
    }

    /// Whether the identity has any connection.
    pub fn contains(&self, identity: &str) -> bool {
        self.connections.lock().contains_key(identity)
    }

    /// Live connection count of one identity.
    pub fn connection_count(&self, identity: &str) -> usize {
        self.connections.lock().get(identity).map_or(0, HashSet::len)
    }

    /// Every identity with a connection, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl PresenceStore for LocalPresence {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn add_connection(&self, identity: &str, connection: &str) -> Result<bool> {
        Ok(self.add(identity, connection))
    }

    async fn remove_connection(&self, identity: &str, connection: &str) -> Result<bool> {
        Ok(self.remove(identity, connection))
    }

    async fn is_online(&self, identity: &str) -> Result<bool> {
        Ok(self.contains(identity))
    }

    async fn list_online(&self) -> Result<Vec<String>> {
        Ok(self.identities())
    }
}

//! Time-boxed advisory locks on editable resources.
//!
//! A resource is either unlocked or locked by one identity. Locks expire
//! `ttl` after acquisition, are released explicitly by their holder, and are
//! dropped in bulk when the holding connection goes away. All transitions go
//! through the `DashMap` entry API so two contenders can never both win.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::time::Instant;

/// A held lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditLock {
    /// Locked resource (a message id).
    pub resource: String,
    /// Identity holding the lock.
    pub holder: String,
    /// Connection that acquired it.
    pub connection: String,
    /// Acquisition time.
    pub acquired_at: Instant,
}

/// Result of [`ConflictManager::lock`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock.
    Acquired,
    /// Another identity holds a live lock.
    Held {
        /// Identity holding the lock.
        holder: String,
    },
}

/// Why an unlock was refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UnlockError {
    /// Nothing to release.
    #[error("no lock found")]
    NoLock,
    /// The lock belongs to someone else.
    #[error("not authorized to unlock")]
    NotHolder {
        /// Identity holding the lock.
        holder: String,
    },
}

/// The lock table.
#[derive(Debug)]
pub struct ConflictManager {
    ttl: Duration,
    locks: DashMap<String, EditLock>,
}

impl ConflictManager {
    /// Lock table whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            locks: DashMap::new(),
        }
    }

    /// Try to lock `resource` for `identity` on `connection`.
    ///
    /// Succeeds when the resource is unlocked, its lock has expired, or the
    /// caller's identity already holds it (the lock is refreshed and moves
    /// to the calling connection).
    pub fn lock(&self, resource: &str, identity: &str, connection: &str) -> LockOutcome {
        let now = Instant::now();
        let fresh = EditLock {
            resource: resource.to_owned(),
            holder: identity.to_owned(),
            connection: connection.to_owned(),
            acquired_at: now,
        };

        match self.locks.entry(resource.to_owned()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.holder == identity || self.expired(current, now) {
                    let _ = entry.insert(fresh);
                    LockOutcome::Acquired
                } else {
                    LockOutcome::Held {
                        holder: current.holder.clone(),
                    }
                }
            }
            Entry::Vacant(entry) => {
                let _ = entry.insert(fresh);
                LockOutcome::Acquired
            }
        }
    }

    /// Release `resource` if `identity` holds it.
    ///
    /// An expired lock counts as absent.
    pub fn unlock(&self, resource: &str, identity: &str) -> Result<EditLock, UnlockError> {
        let now = Instant::now();
        match self.locks.entry(resource.to_owned()) {
            Entry::Occupied(entry) => {
                if self.expired(entry.get(), now) {
                    let _ = entry.remove();
                    Err(UnlockError::NoLock)
                } else if entry.get().holder == identity {
                    Ok(entry.remove())
                } else {
                    Err(UnlockError::NotHolder {
                        holder: entry.get().holder.clone(),
                    })
                }
            }
            Entry::Vacant(_) => Err(UnlockError::NoLock),
        }
    }

    /// Whether a live lock exists on `resource`.
    pub fn is_locked(&self, resource: &str) -> bool {
        self.lock_owner(resource).is_some()
    }

    /// Holder of the live lock on `resource`, if any.
    pub fn lock_owner(&self, resource: &str) -> Option<String> {
        let now = Instant::now();
        self.locks
            .get(resource)
            .filter(|lock| !self.expired(lock, now))
            .map(|lock| lock.holder.clone())
    }

    /// Holder of a live lock on `resource` other than `identity`.
    pub fn locked_by_other(&self, resource: &str, identity: &str) -> Option<String> {
        self.lock_owner(resource).filter(|holder| holder != identity)
    }

    /// Drop every lock acquired through `connection` and return them.
    pub fn release_connection_locks(&self, connection: &str) -> Vec<EditLock> {
        let candidates: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.connection == connection)
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|resource| {
                self.locks
                    .remove_if(&resource, |_, lock| lock.connection == connection)
                    .map(|(_, lock)| lock)
            })
            .collect()
    }

    /// Drop expired locks. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.locks.len();
        self.locks.retain(|_, lock| !self.expired(lock, now));
        before.saturating_sub(self.locks.len())
    }

    /// Number of entries in the table (live or not yet swept).
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn expired(&self, lock: &EditLock, now: Instant) -> bool {
        now.duration_since(lock.acquired_at) >= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn second_identity_sees_holder() {
        let locks = ConflictManager::new(TTL);
        assert_eq!(locks.lock("m1", "alice", "c1"), LockOutcome::Acquired);
        assert_eq!(
            locks.lock("m1", "bob", "c2"),
            LockOutcome::Held {
                holder: "alice".into()
            }
        );
        assert_eq!(locks.lock_owner("m1").as_deref(), Some("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_identity_refreshes() {
        let locks = ConflictManager::new(TTL);
        assert_eq!(locks.lock("m1", "alice", "c1"), LockOutcome::Acquired);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(locks.lock("m1", "alice", "c2"), LockOutcome::Acquired);
        tokio::time::advance(Duration::from_secs(200)).await;
        // refreshed at t=200, so still live at t=400
        assert_matches!(locks.lock("m1", "bob", "c3"), LockOutcome::Held { .. });
        // and it moved to c2
        assert!(locks.release_connection_locks("c1").is_empty());
        assert_eq!(locks.release_connection_locks("c2").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken() {
        let locks = ConflictManager::new(TTL);
        let _ = locks.lock("m1", "alice", "c1");
        tokio::time::advance(TTL).await;
        assert!(!locks.is_locked("m1"));
        assert_eq!(locks.lock("m1", "carol", "c3"), LockOutcome::Acquired);
        assert_eq!(locks.lock_owner("m1").as_deref(), Some("carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_rules() {
        let locks = ConflictManager::new(TTL);
        assert_eq!(locks.unlock("m1", "alice"), Err(UnlockError::NoLock));

        let _ = locks.lock("m1", "alice", "c1");
        assert_eq!(
            locks.unlock("m1", "bob"),
            Err(UnlockError::NotHolder {
                holder: "alice".into()
            })
        );
        let released = locks.unlock("m1", "alice").unwrap();
        assert_eq!(released.connection, "c1");
        assert!(!locks.is_locked("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_after_expiry_reports_no_lock() {
        let locks = ConflictManager::new(TTL);
        let _ = locks.lock("m1", "alice", "c1");
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(locks.unlock("m1", "alice"), Err(UnlockError::NoLock));
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_connection_locks_only_touches_that_connection() {
        let locks = ConflictManager::new(TTL);
        let _ = locks.lock("m1", "alice", "c1");
        let _ = locks.lock("m2", "alice", "c1");
        let _ = locks.lock("m3", "alice", "c2");

        let mut released: Vec<String> = locks
            .release_connection_locks("c1")
            .into_iter()
            .map(|l| l.resource)
            .collect();
        released.sort();
        assert_eq!(released, vec!["m1", "m2"]);
        assert!(locks.is_locked("m3"));
        assert_eq!(locks.lock("m1", "bob", "c9"), LockOutcome::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_sweeps_expired() {
        let locks = ConflictManager::new(TTL);
        let _ = locks.lock("m1", "alice", "c1");
        tokio::time::advance(Duration::from_secs(200)).await;
        let _ = locks.lock("m2", "bob", "c2");
        tokio::time::advance(Duration::from_secs(100)).await;

        assert_eq!(locks.cleanup(), 1);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks.locked_by_other("m2", "alice").as_deref(), Some("bob"));
        assert_eq!(locks.locked_by_other("m2", "bob"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_contenders_yield_one_winner() {
        let locks = Arc::new(ConflictManager::new(TTL));
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.lock("m1", &format!("user-{i}"), &format!("conn-{i}"))
            }));
        }
        let mut winners = 0;
        let mut holders = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                LockOutcome::Acquired => winners += 1,
                LockOutcome::Held { holder } => holders.push(holder),
            }
        }
        assert_eq!(winners, 1);
        let owner = locks.lock_owner("m1").unwrap();
        assert!(holders.iter().all(|h| *h == owner));
    }
}

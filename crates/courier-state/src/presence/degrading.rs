use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{LocalPresence, PresenceStore};
use crate::errors::{Result, StateError};
use crate::{BACKING_STORE_DEGRADED_TOTAL, bounded};

/// A presence write the primary has not acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Write {
    Add { identity: String, connection: String },
    Remove { identity: String, connection: String },
}

impl Write {
    fn operation(&self) -> &'static str {
        match self {
            Self::Add { .. } => "presence.add_connection",
            Self::Remove { .. } => "presence.remove_connection",
        }
    }
}

/// Bounds a primary presence store and falls back to a local mirror.
///
/// Every mutation is applied to the mirror first, then to the primary under
/// `timeout`. When the primary errors or times out the mirror's answer is
/// returned instead, the failure is logged and counted, and the write joins a
/// backlog. The backlog is replayed in order before the next write reaches
/// the primary, so a connection added or removed during an outage never
/// leaves shared state disagreeing with this process. Both writes are
/// idempotent, so replaying one that did land is harmless.
///
/// After a failure the primary is left alone for `timeout` so an outage
/// costs one bounded wait, not one per call.
pub struct DegradingPresence {
    primary: Arc<dyn PresenceStore>,
    mirror: LocalPresence,
    timeout: Duration,
    degraded: AtomicBool,
    backlog: Mutex<VecDeque<Write>>,
    failed_at: parking_lot::Mutex<Option<Instant>>,
}

impl DegradingPresence {
    /// Wrap `primary`, bounding each call by `timeout`.
    pub fn new(primary: Arc<dyn PresenceStore>, timeout: Duration) -> Self {
        Self {
            primary,
            mirror: LocalPresence::new(),
            timeout,
            degraded: AtomicBool::new(false),
            backlog: Mutex::new(VecDeque::new()),
            failed_at: parking_lot::Mutex::new(None),
        }
    }

    fn fail(&self, operation: &'static str, err: &StateError) {
        counter!(BACKING_STORE_DEGRADED_TOTAL, "store" => "presence").increment(1);
        *self.failed_at.lock() = Some(Instant::now());
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                operation,
                backend = self.primary.backend(),
                error = %err,
                "presence store degraded, answering from process-local record"
            );
        }
    }

    fn ok(&self) {
        *self.failed_at.lock() = None;
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(backend = self.primary.backend(), "presence store recovered");
        }
    }

    fn cooling_down(&self) -> bool {
        self.failed_at
            .lock()
            .is_some_and(|at| at.elapsed() < self.timeout)
    }

    async fn apply(&self, write: &Write) -> Result<bool> {
        let op = write.operation();
        match write {
            Write::Add { identity, connection } => {
                bounded(op, self.timeout, self.primary.add_connection(identity, connection)).await
            }
            Write::Remove { identity, connection } => {
                bounded(op, self.timeout, self.primary.remove_connection(identity, connection))
                    .await
            }
        }
    }

    /// Replay the backlog oldest first. Returns whether the primary is
    /// caught up.
    async fn drain(&self, backlog: &mut VecDeque<Write>) -> bool {
        if backlog.is_empty() {
            return true;
        }
        if self.cooling_down() {
            return false;
        }
        let pending = backlog.len();
        while let Some(write) = backlog.front() {
            if let Err(e) = self.apply(write).await {
                self.fail("presence.replay", &e);
                return false;
            }
            let _ = backlog.pop_front();
        }
        self.ok();
        info!(backend = self.primary.backend(), replayed = pending, "presence writes replayed");
        true
    }

    async fn write(&self, write: Write, local: bool) -> bool {
        let mut backlog = self.backlog.lock().await;
        if self.drain(&mut backlog).await && !self.cooling_down() {
            match self.apply(&write).await {
                Ok(transition) => {
                    self.ok();
                    return transition;
                }
                Err(e) => self.fail(write.operation(), &e),
            }
        }
        backlog.push_back(write);
        local
    }

    /// Whether reads may go to the primary.
    async fn caught_up(&self) -> bool {
        if self.cooling_down() {
            return false;
        }
        match self.backlog.try_lock() {
            Ok(mut backlog) => self.drain(&mut backlog).await,
            // a writer holds the backlog and replays it first
            Err(_) => true,
        }
    }

    /// Writes waiting for the primary.
    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }
}

#[async_trait]
impl PresenceStore for DegradingPresence {
    fn backend(&self) -> &'static str {
        self.primary.backend()
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn add_connection(&self, identity: &str, connection: &str) -> Result<bool> {
        let local = self.mirror.add(identity, connection);
        let write = Write::Add {
            identity: identity.to_owned(),
            connection: connection.to_owned(),
        };
        Ok(self.write(write, local).await)
    }

    async fn remove_connection(&self, identity: &str, connection: &str) -> Result<bool> {
        let local = self.mirror.remove(identity, connection);
        let write = Write::Remove {
            identity: identity.to_owned(),
            connection: connection.to_owned(),
        };
        Ok(self.write(write, local).await)
    }

    async fn is_online(&self, identity: &str) -> Result<bool> {
        if !self.caught_up().await {
            return Ok(self.mirror.contains(identity));
        }
        let op = "presence.is_online";
        match bounded(op, self.timeout, self.primary.is_online(identity)).await {
            Ok(online) => {
                self.ok();
                Ok(online)
            }
            Err(e) => {
                self.fail(op, &e);
                Ok(self.mirror.contains(identity))
            }
        }
    }

    async fn list_online(&self) -> Result<Vec<String>> {
        if !self.caught_up().await {
            return Ok(self.mirror.identities());
        }
        let op = "presence.list_online";
        match bounded(op, self.timeout, self.primary.list_online()).await {
            Ok(ids) => {
                self.ok();
                Ok(ids)
            }
            Err(e) => {
                self.fail(op, &e);
                Ok(self.mirror.identities())
            }
        }
    }

    async fn reconcile(&self) -> usize {
        let mut backlog = self.backlog.lock().await;
        let pending = backlog.len();
        if pending == 0 {
            return 0;
        }
        let _ = self.drain(&mut backlog).await;
        pending - backlog.len()
    }
}

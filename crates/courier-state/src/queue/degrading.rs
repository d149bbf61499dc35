use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::{info, warn};

use super::{DRAIN_ATTEMPTS, MemoryQueue, OfflineQueue, Peeked, QueuedMessage};
use crate::errors::{Result, StateError};
use crate::{BACKING_STORE_DEGRADED_TOTAL, bounded};

/// Bounds a primary queue and spills to memory when it fails.
///
/// Enqueues that the primary rejects land in a process-local
/// [`MemoryQueue`]; dequeues drain both and merge them by `queuedAt`, so a
/// recipient reconnecting to this process still gets everything that was
/// spilled here.
///
/// The primary is drained in two bounded steps: read, then remove what was
/// read. A read that times out removes nothing. A removal that times out
/// still returns what was read, and the entries may come back on the next
/// drain if the removal never landed.
pub struct DegradingQueue {
    primary: Arc<dyn OfflineQueue>,
    spill: MemoryQueue,
    timeout: Duration,
    degraded: AtomicBool,
}

impl DegradingQueue {
    /// Wrap `primary`; spilled queues use the same `retention`.
    pub fn new(primary: Arc<dyn OfflineQueue>, retention: Duration, timeout: Duration) -> Self {
        Self {
            primary,
            spill: MemoryQueue::new(retention),
            timeout,
            degraded: AtomicBool::new(false),
        }
    }

    fn fail(&self, operation: &'static str, err: &StateError) {
        counter!(BACKING_STORE_DEGRADED_TOTAL, "store" => "queue").increment(1);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                operation,
                backend = self.primary.backend(),
                error = %err,
                "offline queue degraded, spilling to process memory"
            );
        }
    }

    fn ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(backend = self.primary.backend(), "offline queue recovered");
        }
    }

    async fn drain_primary(&self, recipient: &str) -> Result<Vec<QueuedMessage>> {
        for _ in 0..DRAIN_ATTEMPTS {
            let peeked = bounded("queue.peek_all", self.timeout, self.primary.peek_all(recipient)).await?;
            if peeked.is_empty() {
                self.ok();
                return Ok(Vec::new());
            }
            let op = "queue.acknowledge";
            match bounded(op, self.timeout, self.primary.acknowledge(recipient, &peeked)).await {
                Ok(true) => {
                    self.ok();
                    return Ok(peeked.messages);
                }
                Ok(false) => continue,
                Err(e) => {
                    self.fail(op, &e);
                    warn!(recipient, count = peeked.entries, "drained messages may be delivered again, removal unconfirmed");
                    return Ok(peeked.messages);
                }
            }
        }
        self.ok();
        Ok(Vec::new())
    }
}

#[async_trait]
impl OfflineQueue for DegradingQueue {
    fn backend(&self) -> &'static str {
        self.primary.backend()
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn enqueue(&self, recipient: &str, message: QueuedMessage) -> Result<()> {
        let op = "queue.enqueue";
        match bounded(op, self.timeout, self.primary.enqueue(recipient, message.clone())).await {
            Ok(()) => self.ok(),
            Err(e) => {
                self.fail(op, &e);
                self.spill.push(recipient, message);
            }
        }
        Ok(())
    }

    async fn peek_all(&self, recipient: &str) -> Result<Peeked> {
        bounded("queue.peek_all", self.timeout, self.primary.peek_all(recipient)).await
    }

    async fn acknowledge(&self, recipient: &str, peeked: &Peeked) -> Result<bool> {
        bounded("queue.acknowledge", self.timeout, self.primary.acknowledge(recipient, peeked)).await
    }

    async fn dequeue_all(&self, recipient: &str) -> Result<Vec<QueuedMessage>> {
        let op = "queue.dequeue_all";
        let mut messages = match self.drain_primary(recipient).await {
            Ok(messages) => messages,
            Err(e) => {
                self.fail(op, &e);
                Vec::new()
            }
        };
        let spilled = self.spill.take(recipient);
        if !spilled.is_empty() {
            messages.extend(spilled);
            messages.sort_by_key(|m| m.queued_at);
        }
        Ok(messages)
    }

    async fn size(&self, recipient: &str) -> Result<usize> {
        let op = "queue.size";
        let primary = match bounded(op, self.timeout, self.primary.size(recipient)).await {
            Ok(n) => {
                self.ok();
                n
            }
            Err(e) => {
                self.fail(op, &e);
                0
            }
        };
        Ok(primary + self.spill.len_of(recipient))
    }

    async fn clear(&self, recipient: &str) -> Result<()> {
        self.spill.drop_queue(recipient);
        let op = "queue.clear";
        match bounded(op, self.timeout, self.primary.clear(recipient)).await {
            Ok(()) => self.ok(),
            Err(e) => self.fail(op, &e),
        }
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        self.spill.purge()
    }
}

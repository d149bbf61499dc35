//! Per-recipient queues of messages that could not be delivered live.
//!
//! A message is queued only when its recipient has no live connection at
//! emit time, and is drained by [`OfflineQueue::dequeue_all`] when the
//! recipient comes back. Draining reads first and removes second: the
//! removal only succeeds if nobody drained or cleared the queue in between,
//! and a removal that fails leaves the messages queued. A message can be
//! delivered twice but is never dropped by a failed drain. The whole queue
//! of a recipient expires after the retention window, refreshed by every
//! enqueue.

mod degrading;
mod memory;
mod redis_backed;

pub use degrading::DegradingQueue;
pub use memory::MemoryQueue;
pub use redis_backed::RedisQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::Result;

/// A queued payload plus the time it was queued.
///
/// Serialized flat: the payload's fields followed by `queuedAt`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// The payload as it would have been emitted live.
    #[serde(flatten)]
    pub message: Map<String, Value>,
    /// When it was queued.
    pub queued_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Stamp `message` with the current time. Non-object payloads are
    /// wrapped as `{"payload": ...}`.
    pub fn new(message: Value) -> Self {
        Self::at(message, Utc::now())
    }

    /// Stamp `message` with an explicit time.
    pub fn at(message: Value, queued_at: DateTime<Utc>) -> Self {
        let mut message = match message {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                let _ = map.insert("payload".to_owned(), other);
                map
            }
        };
        let _ = message.remove("queuedAt");
        Self { message, queued_at }
    }

    /// Field of the payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.message.get(key)
    }
}

/// How many times a drain retries after losing a race with another drain.
pub const DRAIN_ATTEMPTS: usize = 3;

/// A non-destructive read of one recipient's queue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Peeked {
    /// Decoded messages, oldest first.
    pub messages: Vec<QueuedMessage>,
    /// Entries read, including any that failed to decode.
    pub entries: usize,
    /// Queue generation at read time. Every removal or clear bumps it.
    pub generation: u64,
}

impl Peeked {
    /// Whether the read found nothing.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Offline message queue contract.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Short backend name for logs and `/health`.
    fn backend(&self) -> &'static str;

    /// Whether the queue is currently writing to a fallback.
    fn is_degraded(&self) -> bool {
        false
    }

    /// Append to the recipient's queue and refresh its retention.
    async fn enqueue(&self, recipient: &str, message: QueuedMessage) -> Result<()>;

    /// Read the recipient's queue, oldest first, without removing anything.
    async fn peek_all(&self, recipient: &str) -> Result<Peeked>;

    /// Remove the entries `peeked` read, provided the queue's generation has
    /// not moved since. Returns `false` when another drain or clear won.
    async fn acknowledge(&self, recipient: &str, peeked: &Peeked) -> Result<bool>;

    /// Read and clear the recipient's queue, oldest first.
    ///
    /// Entries are removed only after they have been read. Losing a race
    /// with a concurrent drain retries up to [`DRAIN_ATTEMPTS`] times and
    /// then yields nothing, leaving the queue to whoever won.
    async fn dequeue_all(&self, recipient: &str) -> Result<Vec<QueuedMessage>> {
        for _ in 0..DRAIN_ATTEMPTS {
            let peeked = self.peek_all(recipient).await?;
            if peeked.is_empty() {
                return Ok(Vec::new());
            }
            if self.acknowledge(recipient, &peeked).await? {
                return Ok(peeked.messages);
            }
        }
        Ok(Vec::new())
    }

    /// Number of queued messages.
    async fn size(&self, recipient: &str) -> Result<usize>;

    /// Drop the recipient's queue.
    async fn clear(&self, recipient: &str) -> Result<()>;

    /// Whether anything is queued.
    async fn has_messages(&self, recipient: &str) -> Result<bool> {
        Ok(self.size(recipient).await? > 0)
    }

    /// Drop queues held in process memory whose retention has lapsed.
    /// Stores that expire entries themselves report 0.
    fn purge_expired(&self) -> usize {
        0
    }
}

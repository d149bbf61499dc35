use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{OfflineQueue, Peeked, QueuedMessage};
use crate::errors::Result;

#[derive(Debug)]
struct Entry {
    messages: Vec<QueuedMessage>,
    expires_at: Instant,
    generation: u64,
}

/// Process-local queue. Best effort: lost on restart, not shared between
/// processes. Retention is enforced lazily whenever a queue is touched and by
/// [`MemoryQueue::purge`].
#[derive(Debug)]
pub struct MemoryQueue {
    retention: Duration,
    queues: Mutex<HashMap<String, Entry>>,
    generations: AtomicU64,
}

impl MemoryQueue {
    /// Queue whose per-recipient lists expire `retention` after the last enqueue.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            queues: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Append and refresh retention.
    pub fn push(&self, recipient: &str, message: QueuedMessage) {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let entry = queues.entry(recipient.to_owned()).or_insert_with(|| Entry {
            messages: Vec::new(),
            expires_at: now,
            generation: self.next_generation(),
        });
        if entry.expires_at <= now {
            entry.messages.clear();
            entry.generation = self.next_generation();
        }
        entry.messages.push(message);
        entry.expires_at = now + self.retention;
    }

    /// Read and clear.
    pub fn take(&self, recipient: &str) -> Vec<QueuedMessage> {
        let now = Instant::now();
        match self.queues.lock().remove(recipient) {
            Some(entry) if entry.expires_at > now => entry.messages,
            _ => Vec::new(),
        }
    }

    /// Snapshot one queue without removing it.
    pub fn peek(&self, recipient: &str) -> Peeked {
        let now = Instant::now();
        match self.queues.lock().get(recipient) {
            Some(entry) if entry.expires_at > now => Peeked {
                messages: entry.messages.clone(),
                entries: entry.messages.len(),
                generation: entry.generation,
            },
            _ => Peeked::default(),
        }
    }

    /// Remove what `peeked` read if the queue has not moved since.
    pub fn remove_peeked(&self, recipient: &str, peeked: &Peeked) -> bool {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let Some(entry) = queues.get_mut(recipient) else {
            return false;
        };
        if entry.expires_at <= now
            || entry.generation != peeked.generation
            || entry.messages.len() < peeked.entries
        {
            return false;
        }
        let _ = entry.messages.drain(..peeked.entries);
        if entry.messages.is_empty() {
            let _ = queues.remove(recipient);
        } else {
            entry.generation = self.next_generation();
        }
        true
    }

    /// Live length of one queue.
    pub fn len_of(&self, recipient: &str) -> usize {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        match queues.get(recipient) {
            Some(entry) if entry.expires_at > now => entry.messages.len(),
            Some(_) => {
                let _ = queues.remove(recipient);
                0
            }
            None => 0,
        }
    }

    /// Drop one queue.
    pub fn drop_queue(&self, recipient: &str) {
        let _ = self.queues.lock().remove(recipient);
    }

    /// Drop every expired queue. Returns how many were dropped.
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let before = queues.len();
        queues.retain(|_, entry| entry.expires_at > now);
        before - queues.len()
    }
}

#[async_trait]
impl OfflineQueue for MemoryQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, recipient: &str, message: QueuedMessage) -> Result<()> {
        self.push(recipient, message);
        Ok(())
    }

    async fn peek_all(&self, recipient: &str) -> Result<Peeked> {
        Ok(self.peek(recipient))
    }

    async fn acknowledge(&self, recipient: &str, peeked: &Peeked) -> Result<bool> {
        Ok(self.remove_peeked(recipient, peeked))
    }

    async fn dequeue_all(&self, recipient: &str) -> Result<Vec<QueuedMessage>> {
        Ok(self.take(recipient))
    }

    async fn size(&self, recipient: &str) -> Result<usize> {
        Ok(self.len_of(recipient))
    }

    async fn clear(&self, recipient: &str) -> Result<()> {
        self.drop_queue(recipient);
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        self.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn msg(content: &str) -> QueuedMessage {
        QueuedMessage::new(json!({ "content": content }))
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_returns_fifo_and_clears() {
        let q = MemoryQueue::new(WEEK);
        q.enqueue("bob", msg("one")).await.unwrap();
        q.enqueue("bob", msg("two")).await.unwrap();
        assert_eq!(q.size("bob").await.unwrap(), 2);
        assert!(q.has_messages("bob").await.unwrap());

        let batch = q.dequeue_all("bob").await.unwrap();
        let contents: Vec<&str> = batch
            .iter()
            .filter_map(|m| m.get("content").and_then(|v| v.as_str()))
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
        assert_eq!(q.size("bob").await.unwrap(), 0);
        assert!(q.dequeue_all("bob").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn peek_leaves_queue_until_acknowledged() {
        let q = MemoryQueue::new(WEEK);
        q.push("bob", msg("one"));
        let peeked = q.peek_all("bob").await.unwrap();
        assert_eq!(peeked.entries, 1);
        assert_eq!(q.size("bob").await.unwrap(), 1);

        q.push("bob", msg("two"));
        assert!(q.acknowledge("bob", &peeked).await.unwrap());
        let rest = q.take("bob");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].get("content"), Some(&json!("two")));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_of_two_racing_drains_wins() {
        let q = MemoryQueue::new(WEEK);
        q.push("bob", msg("one"));
        q.push("bob", msg("two"));
        let first = q.peek("bob");
        let second = q.peek("bob");

        assert!(q.remove_peeked("bob", &first));
        assert!(!q.remove_peeked("bob", &second));
        assert_eq!(q.len_of("bob"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_peek_cannot_trim_a_recreated_queue() {
        let q = MemoryQueue::new(WEEK);
        q.push("bob", msg("old"));
        let stale = q.peek("bob");
        q.drop_queue("bob");
        q.push("bob", msg("new"));

        assert!(!q.remove_peeked("bob", &stale));
        assert_eq!(q.len_of("bob"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_dequeues_empty() {
        let q = MemoryQueue::new(WEEK);
        assert!(q.dequeue_all("nobody").await.unwrap().is_empty());
        assert!(!q.has_messages("nobody").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn whole_queue_expires_after_retention() {
        let q = MemoryQueue::new(Duration::from_secs(100));
        q.push("bob", msg("old"));
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(q.len_of("bob"), 0);
        assert!(q.take("bob").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_refreshes_retention() {
        let q = MemoryQueue::new(Duration::from_secs(100));
        q.push("bob", msg("first"));
        tokio::time::advance(Duration::from_secs(80)).await;
        q.push("bob", msg("second"));
        tokio::time::advance(Duration::from_secs(80)).await;
        assert_eq!(q.take("bob").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_after_expiry_starts_fresh() {
        let q = MemoryQueue::new(Duration::from_secs(10));
        q.push("bob", msg("stale"));
        tokio::time::advance(Duration::from_secs(11)).await;
        q.push("bob", msg("fresh"));
        let batch = q.take("bob");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].get("content"), Some(&json!("fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_and_clear() {
        let q = MemoryQueue::new(Duration::from_secs(10));
        q.push("a", msg("x"));
        tokio::time::advance(Duration::from_secs(5)).await;
        q.push("b", msg("y"));
        q.push("c", msg("z"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(q.purge(), 1);

        q.clear("b").await.unwrap();
        assert_eq!(q.size("b").await.unwrap(), 0);
        assert_eq!(q.size("c").await.unwrap(), 1);
    }
}

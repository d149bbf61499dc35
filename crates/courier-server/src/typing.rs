//! Per-connection typing quiet timers.
//!
//! One pending timer per conversation. Each `typing` event restarts the
//! conversation's timer; when it runs out without further activity the
//! callback fires (the router emits `typing-stopped`). Disconnect cancels
//! everything and reports which conversations still had a pending timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_core::ConversationId;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

#[derive(Debug)]
struct Pending {
    generation: u64,
    handle: AbortHandle,
}

/// Typing timers of one connection.
#[derive(Debug, Default)]
pub struct TypingTimers {
    pending: Arc<Mutex<HashMap<ConversationId, Pending>>>,
    generation: AtomicU64,
}

impl TypingTimers {
    /// Empty timer table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart the quiet timer for `conversation`. `on_quiet` runs once if no
    /// further `touch` or cancel arrives within `quiet`.
    pub fn touch<F>(&self, conversation: &ConversationId, quiet: Duration, on_quiet: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let key = conversation.clone();

        // Spawn under the lock so the timer always finds its own entry.
        let mut table = self.pending.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            let fire = {
                let mut table = pending.lock();
                match table.get(&key) {
                    Some(p) if p.generation == generation => {
                        let _ = table.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                on_quiet();
            }
        });
        let previous = table.insert(
            conversation.clone(),
            Pending {
                generation,
                handle: task.abort_handle(),
            },
        );
        drop(table);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Cancel the timer for `conversation`. Returns whether one was pending.
    pub fn cancel(&self, conversation: &ConversationId) -> bool {
        match self.pending.lock().remove(conversation) {
            Some(p) => {
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer, returning the conversations that had one pending.
    pub fn cancel_all(&self) -> Vec<ConversationId> {
        let drained: Vec<(ConversationId, Pending)> = self.pending.lock().drain().collect();
        drained
            .into_iter()
            .map(|(conversation, p)| {
                p.handle.abort();
                conversation
            })
            .collect()
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

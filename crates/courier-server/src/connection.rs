//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use courier_core::{ConnectionId, Identity, UserId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use crate::protocol::event_frame;
use crate::typing::TypingTimers;

/// Dropped frames after which a connection is treated as a stalled reader
/// and closed.
pub const SLOW_CLIENT_DROP_LIMIT: u64 = 256;

/// A connected, authenticated client.
///
/// A connection starts *held*: frames routed to it are buffered until
/// [`release`](Self::release), so the queued-message flush that runs on
/// connect always reaches the client before any live traffic.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Authenticated principal, fixed for the connection's lifetime.
    pub identity: Identity,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last ping check.
    is_alive: AtomicBool,
    /// When the last pong (or any inbound frame) was received.
    last_pong: Mutex<Instant>,
    /// Count of frames dropped because the channel was full.
    dropped_messages: AtomicU64,
    /// Frames buffered while held; `None` once released.
    held: Mutex<Option<Vec<Arc<String>>>>,
    /// Pending `typing-stopped` timers.
    pub typing: TypingTimers,
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create a held connection for `identity`.
    pub fn new(identity: Identity, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            identity,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            held: Mutex::new(Some(Vec::new())),
            typing: TypingTimers::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Owning identity's id.
    pub fn user_id(&self) -> &UserId {
        &self.identity.id
    }

    /// Route a frame to the client, buffering it while the connection is
    /// held.
    ///
    /// Returns `false` if the frame was dropped (channel full or closed).
    pub fn send(&self, frame: Arc<String>) -> bool {
        let mut held = self.held.lock();
        if let Some(buffer) = held.as_mut() {
            buffer.push(frame);
            return true;
        }
        drop(held);
        self.send_direct(frame)
    }

    /// Write a frame to the channel, bypassing the hold buffer.
    pub fn send_direct(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            return true;
        }
        let dropped = self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped >= SLOW_CLIENT_DROP_LIMIT && !self.closed.is_cancelled() {
            warn!(conn_id = %self.id, dropped, "client not draining its queue, closing");
            self.close();
        }
        false
    }

    /// Serialize and route an `{event, data}` frame.
    pub fn send_event(&self, event: &str, data: &Value) -> bool {
        self.send(event_frame(event, data))
    }

    /// Flush buffered frames in order and stop holding. Idempotent.
    pub fn release(&self) {
        let mut held = self.held.lock();
        if let Some(buffer) = held.take() {
            for frame in buffer {
                let _ = self.send_direct(frame);
            }
        }
    }

    /// Whether frames are still being buffered.
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or inbound frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for the ping cycle.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Ask the session to end.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.identity.id)
            .field("held", &self.is_held())
            .finish_non_exhaustive()
    }
}

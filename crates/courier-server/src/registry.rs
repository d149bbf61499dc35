//! Connection registry: binds identities to live connections, owns room
//! membership, and is the single entry point for emitting events.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use courier_core::{ConnectionId, ConversationStore, UserId};
use courier_state::{BACKING_STORE_DEGRADED_TOTAL, PresenceStore, bounded};
use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::{ClusterEnvelope, ClusterPublisher};
use crate::connection::ClientConnection;
use crate::protocol::event_frame;
use crate::rooms::{RoomTable, conversation_room, user_room};

/// Live connections of this process plus the presence store shared with
/// the rest of the cluster.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    rooms: RoomTable,
    presence: Arc<dyn PresenceStore>,
    conversations: Arc<dyn ConversationStore>,
    store_timeout: Duration,
    cluster: OnceLock<ClusterPublisher>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        conversations: Arc<dyn ConversationStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: RoomTable::new(),
            presence,
            conversations,
            store_timeout,
            cluster: OnceLock::new(),
        }
    }

    /// Route room emits through `publisher` as well. Returns `false` if a
    /// publisher was already attached.
    pub fn attach_cluster(&self, publisher: ClusterPublisher) -> bool {
        self.cluster.set(publisher).is_ok()
    }

    /// Whether emits are forwarded to other nodes.
    pub fn is_clustered(&self) -> bool {
        self.cluster.get().is_some()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Register a connection and join its rooms.
    ///
    /// Returns `true` when this is the identity's first live connection.
    /// Presence and conversation lookups are bounded; their failures are
    /// logged and answered from local state.
    pub async fn register(&self, conn: Arc<ClientConnection>) -> bool {
        let user = conn.user_id().clone();
        let conn_id = conn.id.clone();
        let _ = self.connections.insert(conn_id.clone(), Arc::clone(&conn));
        let _ = self.rooms.join(&user_room(&user), &conn_id);

        match tokio::time::timeout(self.store_timeout, self.conversations.for_participant(&user))
            .await
        {
            Ok(Ok(conversations)) => {
                for conversation in &conversations {
                    let _ = self.rooms.join(&conversation_room(&conversation.id), &conn_id);
                }
                debug!(%conn_id, user_id = %user, rooms = conversations.len() + 1, "joined rooms");
            }
            Ok(Err(error)) => {
                warn!(%conn_id, user_id = %user, %error, "conversation lookup failed, joined identity room only");
            }
            Err(_) => {
                warn!(%conn_id, user_id = %user, "conversation lookup timed out, joined identity room only");
            }
        }

        let added = bounded(
            "presence.add_connection",
            self.store_timeout,
            self.presence.add_connection(&user, &conn_id),
        )
        .await;
        match added {
            Ok(first) => first,
            Err(error) => {
                counter!(BACKING_STORE_DEGRADED_TOTAL, "store" => "presence").increment(1);
                warn!(%conn_id, user_id = %user, %error, "presence add failed, using local record");
                self.local_connection_count(&user) == 1
            }
        }
    }

    /// Remove a connection from the registry and every room.
    ///
    /// Returns `true` when the identity has no live connection left.
    pub async fn unregister(&self, conn: &ClientConnection) -> bool {
        let user = conn.user_id();
        let _ = self.connections.remove(&conn.id);
        let _ = self.rooms.leave_all(&conn.id);

        let removed = bounded(
            "presence.remove_connection",
            self.store_timeout,
            self.presence.remove_connection(user, &conn.id),
        )
        .await;
        match removed {
            Ok(last) => last,
            Err(error) => {
                counter!(BACKING_STORE_DEGRADED_TOTAL, "store" => "presence").increment(1);
                warn!(conn_id = %conn.id, user_id = %user, %error, "presence remove failed, using local record");
                self.local_connection_count(user) == 0
            }
        }
    }

    // ── Rooms ──────────────────────────────────────────────────────────

    /// Add a local connection to `room`. Returns `false` for unknown
    /// connections.
    pub fn join_room(&self, connection: &ConnectionId, room: &str) -> bool {
        if !self.connections.contains_key(connection) {
            return false;
        }
        let _ = self.rooms.join(room, connection);
        true
    }

    /// Add every local connection of `user` to `room`. Returns how many joined.
    pub fn join_identity(&self, user: &UserId, room: &str) -> usize {
        self.rooms
            .members(&user_room(user))
            .iter()
            .filter(|conn_id| self.rooms.join(room, conn_id))
            .count()
    }

    /// Remove a local connection from `room`.
    pub fn leave_room(&self, connection: &ConnectionId, room: &str) -> bool {
        self.rooms.leave(room, connection)
    }

    /// Whether a local connection is in `room`.
    pub fn is_member(&self, room: &str, connection: &ConnectionId) -> bool {
        self.rooms.is_member(room, connection)
    }

    // ── Emit ───────────────────────────────────────────────────────────

    /// Emit to every connection in `room`, on this node and (when
    /// clustered) on the others.
    pub fn emit_to_room(&self, room: &str, event: &str, data: &Value) -> usize {
        self.emit(room, None, event, data)
    }

    /// Emit to `room` skipping one connection (typically the sender).
    pub fn emit_to_room_except(
        &self,
        room: &str,
        except: &ConnectionId,
        event: &str,
        data: &Value,
    ) -> usize {
        self.emit(room, Some(except), event, data)
    }

    /// Emit to every connection of `user`.
    pub fn emit_to_identity(&self, user: &UserId, event: &str, data: &Value) -> usize {
        self.emit(&user_room(user), None, event, data)
    }

    /// Emit to a single local connection.
    pub fn emit_to_connection(&self, connection: &ConnectionId, event: &str, data: &Value) -> bool {
        match self.connections.get(connection) {
            Some(conn) => conn.send_event(event, data),
            None => false,
        }
    }

    fn emit(&self, room: &str, except: Option<&ConnectionId>, event: &str, data: &Value) -> usize {
        if let Some(cluster) = self.cluster.get() {
            cluster.publish(room, except, event, data);
        }
        let delivered = self.deliver_local(room, except, &event_frame(event, data));
        debug!(room, event, delivered, "emit");
        delivered
    }

    /// Write a prepared frame to this node's members of `room`.
    pub fn deliver_local(
        &self,
        room: &str,
        except: Option<&ConnectionId>,
        frame: &Arc<String>,
    ) -> usize {
        let mut delivered = 0;
        for conn_id in self.rooms.members(room) {
            if except == Some(&conn_id) {
                continue;
            }
            let Some(conn) = self.connections.get(&conn_id).map(|c| Arc::clone(c.value())) else {
                continue;
            };
            if conn.send(Arc::clone(frame)) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id, room, "failed to send frame to client");
            }
        }
        delivered
    }

    /// Deliver an envelope published by another node.
    pub fn deliver_remote(&self, envelope: &ClusterEnvelope) -> usize {
        let frame = event_frame(&envelope.event, &envelope.data);
        self.deliver_local(&envelope.room, envelope.except.as_ref(), &frame)
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// Whether `user` has a live connection anywhere in the cluster.
    pub async fn is_reachable(&self, user: &UserId) -> bool {
        if self.local_connection_count(user) > 0 {
            return true;
        }
        match bounded(
            "presence.is_online",
            self.store_timeout,
            self.presence.is_online(user),
        )
        .await
        {
            Ok(online) => online,
            Err(error) => {
                counter!(BACKING_STORE_DEGRADED_TOTAL, "store" => "presence").increment(1);
                warn!(user_id = %user, %error, "presence lookup failed, using local record");
                false
            }
        }
    }

    /// Identities with a live connection anywhere in the cluster.
    pub async fn online_identities(&self) -> Vec<String> {
        match bounded(
            "presence.list_online",
            self.store_timeout,
            self.presence.list_online(),
        )
        .await
        {
            Ok(online) => online,
            Err(error) => {
                warn!(%error, "presence listing failed, using local record");
                let local: HashSet<String> = self
                    .connections
                    .iter()
                    .map(|c| c.user_id().to_string())
                    .collect();
                local.into_iter().collect()
            }
        }
    }

    /// Look up a local connection.
    pub fn get(&self, connection: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(connection).map(|c| Arc::clone(c.value()))
    }

    /// Number of local connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn local_connection_count(&self, user: &UserId) -> usize {
        self.rooms.member_count(&user_room(user))
    }

    /// Presence backend name.
    pub fn presence_backend(&self) -> &'static str {
        self.presence.backend()
    }

    /// Whether presence is answering from its fallback.
    pub fn presence_degraded(&self) -> bool {
        self.presence.is_degraded()
    }

    /// Push presence writes that missed the backing store during an outage.
    /// Returns how many were applied.
    pub async fn reconcile_presence(&self) -> usize {
        self.presence.reconcile().await
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("presence", &self.presence.backend())
            .field("clustered", &self.is_clustered())
            .finish_non_exhaustive()
    }
}

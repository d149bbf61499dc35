//! Room addressing and membership.
//!
//! Rooms are derived fan-out groups: `user:<id>` holds every connection of
//! an identity, `conversation:<id>` every connection that joined the
//! conversation, `notification-type:<type>` every connection subscribed to
//! broadcasts of that notification type.

use std::collections::HashSet;

use courier_core::ConnectionId;
use dashmap::DashMap;

/// Room holding every connection of `user`.
pub fn user_room(user: &str) -> String {
    format!("user:{user}")
}

/// Room holding every connection that joined `conversation`.
pub fn conversation_room(conversation: &str) -> String {
    format!("conversation:{conversation}")
}

/// Room holding every connection subscribed to `kind` broadcasts.
pub fn notification_type_room(kind: &str) -> String {
    format!("notification-type:{kind}")
}

/// Two-way index of room membership.
///
/// Guards on the two maps are never held at the same time.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: DashMap<String, HashSet<ConnectionId>>,
    memberships: DashMap<ConnectionId, HashSet<String>>,
}

impl RoomTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `room`. Returns `false` if it was already a member.
    pub fn join(&self, room: &str, connection: &ConnectionId) -> bool {
        let added = self
            .rooms
            .entry(room.to_owned())
            .or_default()
            .insert(connection.clone());
        let _ = self
            .memberships
            .entry(connection.clone())
            .or_default()
            .insert(room.to_owned());
        added
    }

    /// Remove `connection` from every room it joined. Returns those rooms.
    pub fn leave_all(&self, connection: &ConnectionId) -> Vec<String> {
        let Some((_, rooms)) = self.memberships.remove(connection) else {
            return Vec::new();
        };
        for room in &rooms {
            let now_empty = match self.rooms.get_mut(room) {
                Some(mut members) => {
                    let _ = members.remove(connection);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                let _ = self.rooms.remove_if(room, |_, members| members.is_empty());
            }
        }
        rooms.into_iter().collect()
    }

    /// Remove `connection` from `room`. Returns `false` if it was not a member.
    pub fn leave(&self, room: &str, connection: &ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut members) => members.remove(connection),
            None => false,
        };
        if removed {
            let _ = self.rooms.remove_if(room, |_, members| members.is_empty());
            if let Some(mut joined) = self.memberships.get_mut(connection) {
                let _ = joined.remove(room);
            }
        }
        removed
    }

    /// Current members of `room`.
    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of members of `room`.
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |members| members.len())
    }

    /// Whether `connection` is in `room`.
    pub fn is_member(&self, room: &str, connection: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(connection))
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

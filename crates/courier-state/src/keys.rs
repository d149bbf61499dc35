//! Redis key layout.

/// Builds every Redis key Courier touches, under an optional prefix.
#[derive(Clone, Debug, Default)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Key builder with `prefix` prepended verbatim.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Set of live connection ids of one identity.
    pub fn user_sockets(&self, identity: &str) -> String {
        format!("{}user_sockets:{identity}", self.prefix)
    }

    /// Set of identities with at least one live connection.
    pub fn online_users(&self) -> String {
        format!("{}online_users:all", self.prefix)
    }

    /// Offline message list of one recipient.
    pub fn offline_queue(&self, recipient: &str) -> String {
        format!("{}offline_messages:{recipient}", self.prefix)
    }

    /// Drain generation counter of one recipient's offline list.
    pub fn offline_queue_generation(&self, recipient: &str) -> String {
        format!("{}offline_messages_gen:{recipient}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprefixed_layout() {
        let keys = KeySpace::default();
        assert_eq!(keys.user_sockets("u1"), "user_sockets:u1");
        assert_eq!(keys.online_users(), "online_users:all");
        assert_eq!(keys.offline_queue("u1"), "offline_messages:u1");
        assert_eq!(keys.offline_queue_generation("u1"), "offline_messages_gen:u1");
    }

    #[test]
    fn prefix_is_prepended() {
        let keys = KeySpace::new("chat:");
        assert_eq!(keys.user_sockets("u1"), "chat:user_sockets:u1");
        assert_eq!(keys.offline_queue("u2"), "chat:offline_messages:u2");
    }
}

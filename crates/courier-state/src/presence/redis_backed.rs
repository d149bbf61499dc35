use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use super::PresenceStore;
use crate::errors::Result;
use crate::keys::KeySpace;

/// Safety TTL on each per-identity connection set, so sets orphaned by a
/// crashed process eventually disappear.
pub const CONNECTION_SET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// KEYS[1] = user_sockets:<id>, KEYS[2] = online_users:all
// ARGV[1] = connection id, ARGV[2] = ttl seconds, ARGV[3] = identity
const ADD_SCRIPT: &str = r"
local added = redis.call('SADD', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
if added == 1 and redis.call('SCARD', KEYS[1]) == 1 then
  return 1
end
return 0
";

// KEYS[1] = user_sockets:<id>, KEYS[2] = online_users:all
// ARGV[1] = connection id, ARGV[2] = identity
const REMOVE_SCRIPT: &str = r"
local removed = redis.call('SREM', KEYS[1], ARGV[1])
if removed == 0 then
  return 0
end
if redis.call('SCARD', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[1])
  redis.call('SREM', KEYS[2], ARGV[2])
  return 1
end
return 0
";

/// Presence shared by every process through Redis.
///
/// Connection-set and online-set updates for one identity run inside a
/// single Lua script, so the first/last transition is decided atomically
/// even when two processes race.
#[derive(Clone)]
pub struct RedisPresence {
    conn: ConnectionManager,
    keys: KeySpace,
    add: Script,
    remove: Script,
}

impl RedisPresence {
    /// Presence over an established connection manager.
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            conn,
            keys,
            add: Script::new(ADD_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
        }
    }
}

impl std::fmt::Debug for RedisPresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPresence")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn add_connection(&self, identity: &str, connection: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let first: i64 = self
            .add
            .key(self.keys.user_sockets(identity))
            .key(self.keys.online_users())
            .arg(connection)
            .arg(CONNECTION_SET_TTL.as_secs())
            .arg(identity)
            .invoke_async(&mut conn)
            .await?;
        Ok(first == 1)
    }

    async fn remove_connection(&self, identity: &str, connection: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let last: i64 = self
            .remove
            .key(self.keys.user_sockets(identity))
            .key(self.keys.online_users())
            .arg(connection)
            .arg(identity)
            .invoke_async(&mut conn)
            .await?;
        Ok(last == 1)
    }

    async fn is_online(&self, identity: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let online: bool = conn.sismember(self.keys.online_users(), identity).await?;
        Ok(online)
    }

    async fn list_online(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(self.keys.online_users()).await?;
        members.sort();
        Ok(members)
    }
}

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use tracing::warn;

use super::{OfflineQueue, Peeked, QueuedMessage};
use crate::errors::Result;
use crate::keys::KeySpace;

// KEYS[1] = offline_messages:<id>, KEYS[2] = offline_messages_gen:<id>
// ARGV[1] = generation read, ARGV[2] = entries read, ARGV[3] = ttl seconds
const ACK_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('LTRIM', KEYS[1], ARGV[2], -1)
redis.call('INCR', KEYS[2])
redis.call('EXPIRE', KEYS[2], ARGV[3])
return 1
";

/// Offline queue stored as one Redis list per recipient, plus a generation
/// counter bumped by every drain and clear.
///
/// Enqueue is `RPUSH` + `EXPIRE` in a `MULTI` block. A drain reads the list
/// and the counter together, then trims exactly the entries it read in a
/// script that refuses when the counter has moved. Nothing is deleted
/// before the read is in hand.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: KeySpace,
    retention: Duration,
    ack: Script,
}

impl RedisQueue {
    /// Queue over an established connection manager.
    pub fn new(conn: ConnectionManager, keys: KeySpace, retention: Duration) -> Self {
        Self {
            conn,
            keys,
            retention,
            ack: Script::new(ACK_SCRIPT),
        }
    }
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("keys", &self.keys)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OfflineQueue for RedisQueue {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, recipient: &str, message: QueuedMessage) -> Result<()> {
        let key = self.keys.offline_queue(recipient);
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.conn.clone();
        let (): () = ::redis::pipe()
            .atomic()
            .rpush(&key, payload)
            .ignore()
            .expire(&key, self.retention.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn peek_all(&self, recipient: &str) -> Result<Peeked> {
        let mut conn = self.conn.clone();
        let (raw, generation): (Vec<String>, Option<u64>) = ::redis::pipe()
            .atomic()
            .lrange(self.keys.offline_queue(recipient), 0, -1)
            .get(self.keys.offline_queue_generation(recipient))
            .query_async(&mut conn)
            .await?;

        let entries = raw.len();
        let messages = raw
            .into_iter()
            .filter_map(|entry| match serde_json::from_str::<QueuedMessage>(&entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(recipient, error = %e, "dropping undecodable queued message");
                    None
                }
            })
            .collect();
        Ok(Peeked {
            messages,
            entries,
            generation: generation.unwrap_or(0),
        })
    }

    async fn acknowledge(&self, recipient: &str, peeked: &Peeked) -> Result<bool> {
        let mut conn = self.conn.clone();
        let trimmed: i64 = self
            .ack
            .key(self.keys.offline_queue(recipient))
            .key(self.keys.offline_queue_generation(recipient))
            .arg(peeked.generation)
            .arg(peeked.entries)
            .arg(self.retention.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(trimmed == 1)
    }

    async fn size(&self, recipient: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(self.keys.offline_queue(recipient)).await?;
        Ok(len)
    }

    async fn clear(&self, recipient: &str) -> Result<()> {
        let generation = self.keys.offline_queue_generation(recipient);
        let mut conn = self.conn.clone();
        let (): () = ::redis::pipe()
            .atomic()
            .del(self.keys.offline_queue(recipient))
            .ignore()
            .incr(&generation, 1)
            .ignore()
            .expire(&generation, self.retention.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

//! `SQLite`-backed collaborator store.

pub mod connection;
pub mod migrations;
mod rows;

pub use connection::{ConnectionConfig, ConnectionPool};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use courier_core::errors::Result;
use courier_core::{
    Conversation, ConversationId, ConversationStore, MessageId, MessageStatus, MessageStore,
    MissedQuery, NewMessage, NewNotification, Notification, NotificationId, NotificationStatus,
    NotificationStore, PresenceStatus, StoreError, StoredMessage, UserId, UserRecord, UserStore,
};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use rows::{MESSAGE_COLUMNS, NOTIFICATION_COLUMNS, USER_COLUMNS, decode_ts, encode_ts};

fn db(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn unavailable(e: r2d2::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Collaborator store persisted in `SQLite`.
///
/// Every trait call runs on the blocking pool with its own pooled
/// connection; the async runtime never blocks on disk I/O.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: ConnectionPool,
}

impl SqliteStore {
    /// Open (and migrate) a database file.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        Self::from_pool(connection::new_file(path, config)?)
    }

    /// Fresh in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::from_pool(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    fn from_pool(pool: ConnectionPool) -> Result<Self> {
        let conn = pool.get().map_err(unavailable)?;
        let _ = migrations::run_migrations(&conn).map_err(db)?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Insert a user or rename an existing one.
    pub fn add_user(&self, id: impl Into<UserId>, display_name: &str) -> Result<UserRecord> {
        let id = id.into();
        let conn = self.pool.get().map_err(unavailable)?;
        let _ = conn
            .execute(
                "INSERT INTO users (id, display_name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
                params![id.as_str(), display_name],
            )
            .map_err(db)?;
        find_user(&conn, &id)
            .map_err(db)?
            .ok_or_else(|| StoreError::not_found("user", id.as_str()))
    }

    /// Make `a` and `b` mutual contacts.
    pub fn add_contacts(&self, a: &UserId, b: &UserId) -> Result<()> {
        let conn = self.pool.get().map_err(unavailable)?;
        for (user, contact) in [(a, b), (b, a)] {
            let _ = conn
                .execute(
                    "INSERT OR IGNORE INTO contacts (user_id, contact_id) VALUES (?1, ?2)",
                    params![user.as_str(), contact.as_str()],
                )
                .map_err(db)?;
        }
        Ok(())
    }

    /// Create a group conversation.
    pub fn add_conversation(&self, participants: &[UserId]) -> Result<Conversation> {
        let conn = self.pool.get().map_err(unavailable)?;
        let id = ConversationId::new();
        let tx = conn.unchecked_transaction().map_err(db)?;
        let _ = tx
            .execute(
                "INSERT INTO conversations (id, is_direct, created_at) VALUES (?1, 0, ?2)",
                params![id.as_str(), encode_ts(Utc::now())],
            )
            .map_err(db)?;
        for user in participants {
            let _ = tx
                .execute(
                    "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
                    params![id.as_str(), user.as_str()],
                )
                .map_err(db)?;
        }
        tx.commit().map_err(db)?;
        Ok(Conversation {
            id,
            participants: participants.to_vec(),
            is_direct: false,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(unavailable)?;
            f(&conn).map_err(db)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

// ── Queries shared by several trait methods ─────────────────────────────────

fn find_message(conn: &Connection, id: &str) -> rusqlite::Result<Option<StoredMessage>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![id],
        rows::message,
    )
    .optional()
}

fn find_user(conn: &Connection, id: &str) -> rusqlite::Result<Option<UserRecord>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![id],
        rows::user,
    )
    .optional()
}

fn load_conversation(conn: &Connection, id: &str) -> rusqlite::Result<Option<Conversation>> {
    let Some(is_direct) = conn
        .query_row(
            "SELECT is_direct FROM conversations WHERE id = ?1",
            params![id],
            |row| row.get::<_, bool>(0),
        )
        .optional()?
    else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY rowid",
    )?;
    let participants = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .map(|r| r.map(UserId::from))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Some(Conversation {
        id: ConversationId::from(id),
        participants,
        is_direct,
    }))
}

fn direct_key(a: &UserId, b: &UserId) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create(&self, message: NewMessage) -> Result<StoredMessage> {
        let conversation = message.conversation_id.clone();
        let stored = self
            .blocking(move |conn| {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM conversations WHERE id = ?1",
                        params![message.conversation_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Ok(None);
                }
                let stored = StoredMessage {
                    id: MessageId::new(),
                    sender: message.sender,
                    recipient: message.recipient,
                    conversation_id: message.conversation_id,
                    content: message.content,
                    status: MessageStatus::Sent,
                    edited: false,
                    deleted: false,
                    created_at: Utc::now().trunc_subsecs(6),
                    edited_at: None,
                };
                let _ = conn.execute(
                    "INSERT INTO messages (id, sender_id, recipient_id, conversation_id, content, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        stored.id.as_str(),
                        stored.sender.as_str(),
                        stored.recipient.as_deref(),
                        stored.conversation_id.as_str(),
                        stored.content,
                        stored.status.as_str(),
                        encode_ts(stored.created_at),
                    ],
                )?;
                Ok(Some(stored))
            })
            .await?;
        stored.ok_or_else(|| StoreError::not_found("conversation", conversation.as_str()))
    }

    async fn find_by_id(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        let id = id.clone();
        self.blocking(move |conn| find_message(conn, &id)).await
    }

    async fn update_status(&self, ids: &[MessageId], status: MessageStatus) -> Result<usize> {
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut changed = 0;
            {
                let mut stmt =
                    tx.prepare("UPDATE messages SET status = ?1 WHERE id = ?2 AND status != ?1")?;
                for id in &ids {
                    changed += stmt.execute(params![status.as_str(), id.as_str()])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    async fn update_content(&self, id: &MessageId, content: &str) -> Result<StoredMessage> {
        let key = id.clone();
        let content = content.to_owned();
        let updated = self
            .blocking(move |conn| {
                let changed = conn.execute(
                    "UPDATE messages SET content = ?1, edited = 1, edited_at = ?2 WHERE id = ?3",
                    params![content, encode_ts(Utc::now()), key.as_str()],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                find_message(conn, &key)
            })
            .await?;
        updated.ok_or_else(|| StoreError::not_found("message", id.as_str()))
    }

    async fn mark_deleted(&self, id: &MessageId) -> Result<StoredMessage> {
        let key = id.clone();
        let updated = self
            .blocking(move |conn| {
                let changed = conn.execute(
                    "UPDATE messages SET deleted = 1, content = '' WHERE id = ?1",
                    params![key.as_str()],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                find_message(conn, &key)
            })
            .await?;
        updated.ok_or_else(|| StoreError::not_found("message", id.as_str()))
    }

    async fn find_since(&self, query: MissedQuery) -> Result<Vec<StoredMessage>> {
        if query.conversations.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }
        self.blocking(move |conn| {
            let placeholders = vec!["?"; query.conversations.len()].join(", ");
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id IN ({placeholders})
                   AND created_at > ? AND sender_id != ? AND deleted = 0
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?"
            );
            let mut values: Vec<Value> = query
                .conversations
                .iter()
                .map(|c| Value::Text(c.to_string()))
                .collect();
            values.push(Value::Text(encode_ts(query.since)));
            values.push(Value::Text(query.exclude_sender.to_string()));
            values.push(Value::Integer(query.limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), rows::message)?;
            rows.collect()
        })
        .await
    }

    async fn recent_in(
        &self,
        conversation: &ConversationId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conversation = conversation.clone();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                   SELECT {MESSAGE_COLUMNS} FROM messages
                   WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at > ?2)
                   ORDER BY created_at DESC, id DESC
                   LIMIT ?3
                 ) ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![conversation.as_str(), since.map(encode_ts), limit as i64],
                rows::message,
            )?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn find_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let id = id.clone();
        self.blocking(move |conn| load_conversation(conn, &id)).await
    }

    async fn for_participant(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let user = user.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM conversation_participants
                 WHERE user_id = ?1 ORDER BY conversation_id",
            )?;
            let ids = stmt
                .query_map(params![user.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut conversations = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(conversation) = load_conversation(conn, &id)? {
                    conversations.push(conversation);
                }
            }
            Ok(conversations)
        })
        .await
    }

    async fn find_or_create_direct(&self, a: &UserId, b: &UserId) -> Result<Conversation> {
        let (a, b) = (a.clone(), b.clone());
        let key = direct_key(&a, &b);
        let missing = key.clone();
        let found = self
            .blocking(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let created = tx.execute(
                    "INSERT OR IGNORE INTO conversations (id, is_direct, direct_key, created_at)
                     VALUES (?1, 1, ?2, ?3)",
                    params![ConversationId::new().as_str(), key, encode_ts(Utc::now())],
                )?;
                let id: String = tx.query_row(
                    "SELECT id FROM conversations WHERE direct_key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                if created == 1 {
                    for user in [&a, &b] {
                        let _ = tx.execute(
                            "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id)
                             VALUES (?1, ?2)",
                            params![id, user.as_str()],
                        )?;
                    }
                }
                tx.commit()?;
                load_conversation(conn, &id)
            })
            .await?;
        found.ok_or_else(|| StoreError::not_found("conversation", missing))
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<UserRecord>> {
        let id = id.clone();
        self.blocking(move |conn| find_user(conn, &id)).await
    }

    async fn update_presence(
        &self,
        id: &UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        let key = id.clone();
        let changed = self
            .blocking(move |conn| {
                conn.execute(
                    "UPDATE users SET status = ?1, last_seen = ?2 WHERE id = ?3",
                    params![status.as_str(), encode_ts(last_seen), key.as_str()],
                )
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::not_found("user", id.as_str()));
        }
        Ok(())
    }

    async fn contacts_of(&self, user: &UserId) -> Result<Vec<UserId>> {
        let user = user.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT contact_id FROM contacts WHERE user_id = ?1 ORDER BY contact_id",
            )?;
            let rows = stmt.query_map(params![user.as_str()], |row| {
                row.get::<_, String>(0).map(UserId::from)
            })?;
            rows.collect()
        })
        .await
    }

    async fn record_conversation_view(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let (user, conversation) = (user.clone(), conversation.clone());
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT viewed_at FROM conversation_views WHERE user_id = ?1 AND conversation_id = ?2",
                    params![user.as_str(), conversation.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let _ = tx.execute(
                "INSERT INTO conversation_views (user_id, conversation_id, viewed_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, conversation_id) DO UPDATE SET viewed_at = excluded.viewed_at",
                params![user.as_str(), conversation.as_str(), encode_ts(at)],
            )?;
            tx.commit()?;
            previous.as_deref().map(|raw| decode_ts(0, raw)).transpose()
        })
        .await
    }
}

const UNREAD_FILTER: &str = "user_id = ?1 AND status = 'unread' AND (expires_at IS NULL OR expires_at > ?2)";

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn insert(&self, notification: NewNotification) -> Result<Notification> {
        let stored = notification.into_notification(Utc::now().trunc_subsecs(6));
        let data = serde_json::to_string(&stored.data)
            .map_err(|e| StoreError::Backend(format!("notification data: {e}")))?;
        let row = stored.clone();
        self.blocking(move |conn| {
            let _ = conn.execute(
                "INSERT INTO notifications
                   (id, user_id, kind, title, message, data, action_url, priority, status, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    row.id.as_str(),
                    row.user.as_str(),
                    row.kind.as_str(),
                    row.title,
                    row.message,
                    data,
                    row.action_url,
                    row.priority.as_str(),
                    row.status.as_str(),
                    encode_ts(row.created_at),
                    row.expires_at.map(encode_ts),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(stored)
    }

    async fn unread(&self, user: &UserId, limit: usize) -> Result<Vec<Notification>> {
        let user = user.clone();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE {UNREAD_FILTER}
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![user.as_str(), encode_ts(Utc::now()), limit as i64],
                rows::notification,
            )?;
            rows.collect()
        })
        .await
    }

    async fn unread_count(&self, user: &UserId) -> Result<usize> {
        let user = user.clone();
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM notifications WHERE {UNREAD_FILTER}"),
                params![user.as_str(), encode_ts(Utc::now())],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
        .await
    }

    async fn mark_read(&self, user: &UserId, id: &NotificationId) -> Result<bool> {
        let (user, id) = (user.clone(), id.clone());
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE notifications SET status = ?1, read_at = ?2 WHERE id = ?3 AND user_id = ?4",
                params![
                    NotificationStatus::Read.as_str(),
                    encode_ts(Utc::now()),
                    id.as_str(),
                    user.as_str()
                ],
            )
            .map(|changed| changed == 1)
        })
        .await
    }

    async fn mark_all_read(&self, user: &UserId) -> Result<usize> {
        let user = user.clone();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE notifications SET status = ?1, read_at = ?2 WHERE user_id = ?3 AND status = 'unread'",
                params![NotificationStatus::Read.as_str(), encode_ts(Utc::now()), user.as_str()],
            )
        })
        .await
    }

    async fn delete(&self, user: &UserId, id: &NotificationId) -> Result<bool> {
        let (user, id) = (user.clone(), id.clone());
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
                params![id.as_str(), user.as_str()],
            )
            .map(|changed| changed == 1)
        })
        .await
    }
}

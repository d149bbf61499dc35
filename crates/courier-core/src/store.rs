//! Collaborator traits for the persistent document store.
//!
//! The delivery layer never owns users, conversations, messages or
//! notifications. It reaches
//! them through these narrow CRUD traits and treats every call as fallible,
//! time-bounded I/O (the caller wraps each call in a timeout).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::ids::{ConversationId, MessageId, NotificationId, UserId};
use crate::models::{
    Conversation, MessageStatus, MissedQuery, NewMessage, NewNotification, Notification,
    PresenceStatus, StoredMessage, UserRecord,
};

/// Persisted chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message with status `sent` and return it.
    async fn create(&self, message: NewMessage) -> Result<StoredMessage>;

    /// Look up a message by id.
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<StoredMessage>>;

    /// Set the status of every listed message. Returns how many changed.
    async fn update_status(&self, ids: &[MessageId], status: MessageStatus) -> Result<usize>;

    /// Replace the content of a message and flag it edited.
    async fn update_content(&self, id: &MessageId, content: &str) -> Result<StoredMessage>;

    /// Soft-delete a message: flag it deleted and blank its content.
    async fn mark_deleted(&self, id: &MessageId) -> Result<StoredMessage>;

    /// Messages created after `query.since` in the given conversations, not
    /// authored by `query.exclude_sender`, oldest first, at most `query.limit`.
    async fn find_since(&self, query: MissedQuery) -> Result<Vec<StoredMessage>>;

    /// The most recent `limit` messages of a conversation created after
    /// `since` (when given), returned oldest first.
    async fn recent_in(
        &self,
        conversation: &ConversationId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;
}

/// Conversations and their participants.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Look up a conversation by id.
    async fn find_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    /// Every conversation `user` participates in.
    async fn for_participant(&self, user: &UserId) -> Result<Vec<Conversation>>;

    /// The direct conversation between `a` and `b`, created on first use.
    async fn find_or_create_direct(&self, a: &UserId, b: &UserId) -> Result<Conversation>;
}

/// Users and their contact lists.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up a user by id.
    async fn find_by_id(&self, id: &UserId) -> Result<Option<UserRecord>>;

    /// Persist presence status and last-seen time.
    async fn update_presence(
        &self,
        id: &UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<()>;

    /// Accepted contacts of `user` (the audience for presence broadcasts).
    async fn contacts_of(&self, user: &UserId) -> Result<Vec<UserId>>;

    /// Record that `user` viewed `conversation` at `at`. Returns the
    /// previously recorded view, if any.
    async fn record_conversation_view(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Per-user notifications.
///
/// Every call is scoped to the owning user: a notification id belonging to
/// someone else behaves as if it did not exist.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new unread notification and return it.
    async fn insert(&self, notification: NewNotification) -> Result<Notification>;

    /// Up to `limit` unread, unexpired notifications of `user`, newest first.
    async fn unread(&self, user: &UserId, limit: usize) -> Result<Vec<Notification>>;

    /// Number of unread, unexpired notifications of `user`.
    async fn unread_count(&self, user: &UserId) -> Result<usize>;

    /// Mark one notification read. Returns `false` if `user` owns no such
    /// notification.
    async fn mark_read(&self, user: &UserId, id: &NotificationId) -> Result<bool>;

    /// Mark every unread notification of `user` read. Returns how many changed.
    async fn mark_all_read(&self, user: &UserId) -> Result<usize>;

    /// Delete one notification. Returns `false` if `user` owns no such
    /// notification.
    async fn delete(&self, user: &UserId, id: &NotificationId) -> Result<bool>;
}

/// The collaborators, shared behind `Arc`s.
#[derive(Clone)]
pub struct Stores {
    /// Message store.
    pub messages: Arc<dyn MessageStore>,
    /// Conversation store.
    pub conversations: Arc<dyn ConversationStore>,
    /// User store.
    pub users: Arc<dyn UserStore>,
    /// Notification store.
    pub notifications: Arc<dyn NotificationStore>,
}

impl Stores {
    /// Bundle a single value implementing every collaborator trait.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: MessageStore + ConversationStore + UserStore + NotificationStore + 'static,
    {
        Self {
            messages: store.clone(),
            conversations: store.clone(),
            users: store.clone(),
            notifications: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

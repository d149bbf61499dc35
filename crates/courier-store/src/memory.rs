//! In-memory collaborator store.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::errors::Result;
use courier_core::{
    Conversation, ConversationId, ConversationStore, MessageId, MessageStatus, MessageStore,
    MissedQuery, NewMessage, NewNotification, Notification, NotificationId, NotificationStatus,
    NotificationStore, PresenceStatus, StoreError, StoredMessage, UserId, UserRecord, UserStore,
};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<UserId, UserRecord>,
    contacts: HashMap<UserId, BTreeSet<UserId>>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<MessageId, StoredMessage>,
    views: HashMap<(UserId, ConversationId), DateTime<Utc>>,
    notifications: HashMap<NotificationId, Notification>,
}

impl Inner {
    fn owned_notification(&mut self, user: &UserId, id: &NotificationId) -> Option<&mut Notification> {
        self.notifications.get_mut(id).filter(|n| &n.user == user)
    }

    fn direct_between(&self, a: &UserId, b: &UserId) -> Option<&Conversation> {
        self.conversations.values().find(|c| {
            c.is_direct && c.participants.len() == 2 && c.has_participant(a) && c.has_participant(b)
        })
    }
}

/// Collaborator store held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user (offline, never seen).
    pub fn add_user(&self, id: impl Into<UserId>, display_name: &str) -> UserRecord {
        let record = UserRecord {
            id: id.into(),
            display_name: display_name.to_owned(),
            status: PresenceStatus::Offline,
            last_seen: None,
        };
        let _ = self
            .inner
            .write()
            .users
            .insert(record.id.clone(), record.clone());
        record
    }

    /// Make `a` and `b` mutual contacts.
    pub fn add_contacts(&self, a: &UserId, b: &UserId) {
        let mut inner = self.inner.write();
        let _ = inner.contacts.entry(a.clone()).or_default().insert(b.clone());
        let _ = inner.contacts.entry(b.clone()).or_default().insert(a.clone());
    }

    /// Create a group conversation.
    pub fn add_conversation(&self, participants: &[UserId]) -> Conversation {
        let conversation = Conversation {
            id: ConversationId::new(),
            participants: participants.to_vec(),
            is_direct: false,
        };
        let _ = self
            .inner
            .write()
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        conversation
    }

    /// Current user record (tests inspect persisted presence through this).
    pub fn user(&self, id: &UserId) -> Option<UserRecord> {
        self.inner.read().users.get(id).cloned()
    }

    /// Number of persisted messages.
    pub fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }

    /// When `user` last viewed `conversation`.
    pub fn last_view(&self, user: &UserId, conversation: &ConversationId) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .views
            .get(&(user.clone(), conversation.clone()))
            .copied()
    }

    /// Look up a notification regardless of owner.
    pub fn notification(&self, id: &NotificationId) -> Option<Notification> {
        self.inner.read().notifications.get(id).cloned()
    }
}

fn chronological(messages: &mut [StoredMessage]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, message: NewMessage) -> Result<StoredMessage> {
        let mut inner = self.inner.write();
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::not_found(
                "conversation",
                message.conversation_id.as_str(),
            ));
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
            created_at: Utc::now(),
            edited_at: None,
        };
        let _ = inner.messages.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        Ok(self.inner.read().messages.get(id).cloned())
    }

    async fn update_status(&self, ids: &[MessageId], status: MessageStatus) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut changed = 0;
        for id in ids {
            if let Some(message) = inner.messages.get_mut(id) {
                if message.status != status {
                    message.status = status;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn update_content(&self, id: &MessageId, content: &str) -> Result<StoredMessage> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("message", id.as_str()))?;
        content.clone_into(&mut message.content);
        message.edited = true;
        message.edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn mark_deleted(&self, id: &MessageId) -> Result<StoredMessage> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("message", id.as_str()))?;
        message.deleted = true;
        message.content.clear();
        Ok(message.clone())
    }

    async fn find_since(&self, query: MissedQuery) -> Result<Vec<StoredMessage>> {
        let inner = self.inner.read();
        let mut found: Vec<StoredMessage> = inner
            .messages
            .values()
            .filter(|m| {
                query.conversations.contains(&m.conversation_id)
                    && m.created_at > query.since
                    && m.sender != query.exclude_sender
                    && !m.deleted
            })
            .cloned()
            .collect();
        chronological(&mut found);
        found.truncate(query.limit);
        Ok(found)
    }

    async fn recent_in(
        &self,
        conversation: &ConversationId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let inner = self.inner.read();
        let mut found: Vec<StoredMessage> = inner
            .messages
            .values()
            .filter(|m| &m.conversation_id == conversation && since.is_none_or(|s| m.created_at > s))
            .cloned()
            .collect();
        chronological(&mut found);
        let skip = found.len().saturating_sub(limit);
        Ok(found.split_off(skip))
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        Ok(self.inner.read().conversations.get(id).cloned())
    }

    async fn for_participant(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let inner = self.inner.read();
        let mut found: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.has_participant(user))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn find_or_create_direct(&self, a: &UserId, b: &UserId) -> Result<Conversation> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.direct_between(a, b) {
            return Ok(existing.clone());
        }
        let conversation = Conversation {
            id: ConversationId::new(),
            participants: vec![a.clone(), b.clone()],
            is_direct: true,
        };
        let _ = inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<UserRecord>> {
        Ok(self.inner.read().users.get(id).cloned())
    }

    async fn update_presence(
        &self,
        id: &UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let user = inner
            .users
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("user", id.as_str()))?;
        user.status = status;
        user.last_seen = Some(last_seen);
        Ok(())
    }

    async fn contacts_of(&self, user: &UserId) -> Result<Vec<UserId>> {
        Ok(self
            .inner
            .read()
            .contacts
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_conversation_view(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .write()
            .views
            .insert((user.clone(), conversation.clone()), at))
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, notification: NewNotification) -> Result<Notification> {
        let stored = notification.into_notification(Utc::now());
        let _ = self
            .inner
            .write()
            .notifications
            .insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn unread(&self, user: &UserId, limit: usize) -> Result<Vec<Notification>> {
        let now = Utc::now();
        let inner = self.inner.read();
        let mut found: Vec<Notification> = inner
            .notifications
            .values()
            .filter(|n| &n.user == user && n.status == NotificationStatus::Unread && !n.is_expired(now))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        found.truncate(limit);
        Ok(found)
    }

    async fn unread_count(&self, user: &UserId) -> Result<usize> {
        let now = Utc::now();
        Ok(self
            .inner
            .read()
            .notifications
            .values()
            .filter(|n| &n.user == user && n.status == NotificationStatus::Unread && !n.is_expired(now))
            .count())
    }

    async fn mark_read(&self, user: &UserId, id: &NotificationId) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(notification) = inner.owned_notification(user, id) else {
            return Ok(false);
        };
        notification.status = NotificationStatus::Read;
        notification.read_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_all_read(&self, user: &UserId) -> Result<usize> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let mut changed = 0;
        for notification in inner.notifications.values_mut() {
            if &notification.user == user && notification.status == NotificationStatus::Unread {
                notification.status = NotificationStatus::Read;
                notification.read_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete(&self, user: &UserId, id: &NotificationId) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.owned_notification(user, id).is_none() {
            return Ok(false);
        }
        Ok(inner.notifications.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use courier_core::NotificationKind;
    use std::time::Duration;

    fn seeded() -> (MemoryStore, UserId, UserId) {
        let store = MemoryStore::new();
        let a = store.add_user("alice", "Alice").id;
        let b = store.add_user("bob", "Bob").id;
        (store, a, b)
    }

    async fn post(store: &MemoryStore, conv: &Conversation, from: &UserId, content: &str) -> StoredMessage {
        let m = store
            .create(NewMessage {
                sender: from.clone(),
                recipient: None,
                conversation_id: conv.id.clone(),
                content: content.into(),
            })
            .await
            .unwrap();
        // keep creation timestamps strictly increasing
        tokio::time::sleep(Duration::from_millis(2)).await;
        m
    }

    #[tokio::test]
    async fn direct_conversation_is_reused_in_either_order() {
        let (store, a, b) = seeded();
        let first = store.find_or_create_direct(&a, &b).await.unwrap();
        let second = store.find_or_create_direct(&b, &a).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.is_direct);
        assert_eq!(ConversationStore::find_by_id(&store, &first.id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn create_requires_existing_conversation() {
        let (store, a, _) = seeded();
        let err = store
            .create(NewMessage {
                sender: a,
                recipient: None,
                conversation_id: ConversationId::from("missing"),
                content: "x".into(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::NotFound { entity: "conversation", .. });
    }

    #[tokio::test]
    async fn find_since_filters_and_orders() {
        let (store, a, b) = seeded();
        let conv = store.find_or_create_direct(&a, &b).await.unwrap();
        let other = store.add_conversation(&[a.clone()]);

        let _old = post(&store, &conv, &b, "old").await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let _mine = post(&store, &conv, &a, "mine").await;
        let first = post(&store, &conv, &b, "first").await;
        let second = post(&store, &conv, &b, "second").await;
        let _elsewhere = post(&store, &other, &b, "elsewhere").await;

        let found = store
            .find_since(MissedQuery {
                conversations: vec![conv.id.clone()],
                since: cutoff,
                exclude_sender: a.clone(),
                limit: 500,
            })
            .await
            .unwrap();
        let ids: Vec<&MessageId> = found.iter().map(|m| &m.id).collect();
        assert_eq!(ids, vec![&first.id, &second.id]);

        let limited = store
            .find_since(MissedQuery {
                conversations: vec![conv.id],
                since: cutoff,
                exclude_sender: a,
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(limited[0].id, first.id);
    }

    #[tokio::test]
    async fn recent_in_returns_latest_window_chronologically() {
        let (store, a, b) = seeded();
        let conv = store.find_or_create_direct(&a, &b).await.unwrap();
        let mut posted = Vec::new();
        for i in 0..5 {
            posted.push(post(&store, &conv, &a, &format!("m{i}")).await.id);
        }
        let recent = store.recent_in(&conv.id, None, 3).await.unwrap();
        let ids: Vec<MessageId> = recent.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, posted[2..].to_vec());
    }

    #[tokio::test]
    async fn status_content_and_delete() {
        let (store, a, b) = seeded();
        let conv = store.find_or_create_direct(&a, &b).await.unwrap();
        let m = post(&store, &conv, &a, "draft").await;

        let changed = store
            .update_status(&[m.id.clone(), MessageId::from("ghost")], MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let edited = store.update_content(&m.id, "final").await.unwrap();
        assert!(edited.edited);
        assert_eq!(edited.content, "final");
        assert!(edited.edited_at.is_some());

        let deleted = store.mark_deleted(&m.id).await.unwrap();
        assert!(deleted.deleted);
        assert!(deleted.content.is_empty());
        assert_eq!(deleted.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn presence_and_contacts() {
        let (store, a, b) = seeded();
        store.add_contacts(&a, &b);
        assert_eq!(store.contacts_of(&a).await.unwrap(), vec![b.clone()]);
        assert_eq!(store.contacts_of(&b).await.unwrap(), vec![a.clone()]);

        let now = Utc::now();
        store
            .update_presence(&a, PresenceStatus::Online, now)
            .await
            .unwrap();
        let user = store.user(&a).unwrap();
        assert_eq!(user.status, PresenceStatus::Online);
        assert_eq!(user.last_seen, Some(now));

        assert_matches!(
            store
                .update_presence(&UserId::from("ghost"), PresenceStatus::Online, now)
                .await,
            Err(StoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn conversation_view_returns_previous() {
        let (store, a, b) = seeded();
        let conv = store.find_or_create_direct(&a, &b).await.unwrap();
        let first = Utc::now();
        assert_eq!(store.record_conversation_view(&a, &conv.id, first).await.unwrap(), None);
        let second = first + chrono::Duration::seconds(5);
        assert_eq!(
            store.record_conversation_view(&a, &conv.id, second).await.unwrap(),
            Some(first)
        );
        assert_eq!(store.last_view(&a, &conv.id), Some(second));
        assert_eq!(store.last_view(&b, &conv.id), None);
    }

    #[tokio::test]
    async fn notifications_are_scoped_to_owner() {
        let (store, a, b) = seeded();
        let older = store
            .insert(NewNotification::new(a.clone(), NotificationKind::Message, "One", "first"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let newer = store
            .insert(NewNotification::new(a.clone(), NotificationKind::Mention, "Two", "second"))
            .await
            .unwrap();
        let mut expired = NewNotification::new(a.clone(), NotificationKind::System, "Old", "gone");
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let _ = store.insert(expired).await.unwrap();

        let unread = store.unread(&a, 50).await.unwrap();
        let ids: Vec<&NotificationId> = unread.iter().map(|n| &n.id).collect();
        assert_eq!(ids, vec![&newer.id, &older.id]);
        assert_eq!(store.unread_count(&a).await.unwrap(), 2);

        assert!(!store.mark_read(&b, &older.id).await.unwrap());
        assert!(store.mark_read(&a, &older.id).await.unwrap());
        let read = store.notification(&older.id).unwrap();
        assert_eq!(read.status, NotificationStatus::Read);
        assert!(read.read_at.is_some());

        assert!(!store.delete(&b, &newer.id).await.unwrap());
        assert!(store.delete(&a, &newer.id).await.unwrap());
        assert!(store.notification(&newer.id).is_none());
        assert_eq!(store.unread_count(&a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_all_read_counts_changes() {
        let (store, a, b) = seeded();
        for title in ["x", "y"] {
            let _ = store
                .insert(NewNotification::new(a.clone(), NotificationKind::System, title, "body"))
                .await
                .unwrap();
        }
        let _ = store
            .insert(NewNotification::new(b.clone(), NotificationKind::System, "z", "body"))
            .await
            .unwrap();

        assert_eq!(store.mark_all_read(&a).await.unwrap(), 2);
        assert_eq!(store.mark_all_read(&a).await.unwrap(), 0);
        assert_eq!(store.unread_count(&b).await.unwrap(), 1);
    }
}

//! Domain records shared between the delivery layer and its collaborators.
//!
//! Records serialize in camelCase because the message payloads go straight
//! onto the wire (`message:new`, `queued-messages`, sync responses).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConversationId, MessageId, NotificationId, UserId};

/// The authenticated principal behind a connection.
///
/// Resolved once at handshake and immutable for the connection's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// User id.
    pub id: UserId,
    /// Human-readable name.
    pub display_name: String,
    /// When the user was last seen before this connection was opened.
    /// Default lower bound for `get-missed-messages`.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Coarse presence status persisted on the user record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// At least one live connection somewhere in the cluster.
    Online,
    /// No live connections.
    Offline,
}

impl PresenceStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// A user as the user store knows it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// User id.
    pub id: UserId,
    /// Human-readable name.
    pub display_name: String,
    /// Last persisted presence status.
    pub status: PresenceStatus,
    /// Last time the user connected or disconnected.
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// The identity a connection authenticated as this user carries.
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            last_seen: self.last_seen,
        }
    }
}

/// A conversation and its participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Every user allowed to read and post.
    pub participants: Vec<UserId>,
    /// Whether this is a two-party direct conversation.
    pub is_direct: bool,
}

impl Conversation {
    /// Whether `user` may read and post in this conversation.
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.iter().any(|p| p == user)
    }

    /// Participants other than `user`.
    pub fn others<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |p| *p != user)
    }
}

/// Delivery status of a persisted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Persisted, not yet acknowledged by the recipient.
    Sent,
    /// Delivered to a recipient device.
    Delivered,
    /// Read by the recipient.
    Read,
}

impl MessageStatus {
    /// Storage/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// Inverse of [`MessageStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

/// A message as persisted by the message store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Message id.
    pub id: MessageId,
    /// Author.
    pub sender: UserId,
    /// Recipient of a direct message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserId>,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Message body. Blank once deleted.
    pub content: String,
    /// Delivery status.
    pub status: MessageStatus,
    /// Whether the content was edited after creation.
    pub edited: bool,
    /// Soft-delete flag.
    pub deleted: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last edit time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Input to [`crate::MessageStore::create`].
#[derive(Clone, Debug)]
pub struct NewMessage {
    /// Author.
    pub sender: UserId,
    /// Recipient of a direct message.
    pub recipient: Option<UserId>,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Message body.
    pub content: String,
}

/// Query behind `get-missed-messages`.
#[derive(Clone, Debug)]
pub struct MissedQuery {
    /// Conversations to search.
    pub conversations: Vec<ConversationId>,
    /// Exclusive lower bound on creation time.
    pub since: DateTime<Utc>,
    /// Author whose own messages are skipped.
    pub exclude_sender: UserId,
    /// Maximum number of messages returned.
    pub limit: usize,
}

/// Longest accepted notification title, in characters.
pub const NOTIFICATION_TITLE_MAX: usize = 200;

/// Longest accepted notification body, in characters.
pub const NOTIFICATION_MESSAGE_MAX: usize = 500;

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $wire)] $variant),+
        }

        impl $name {
            /// Every variant.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Storage/wire name.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }

            /// Inverse of `as_str`.
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($wire => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// What a notification is about.
    NotificationKind {
        /// New message.
        Message => "message",
        /// Mentioned in a message.
        Mention => "mention",
        /// Reaction to one of the user's messages.
        Reaction => "reaction",
        /// Invited to a group.
        GroupInvite => "group_invite",
        /// Added to a group.
        GroupAdd => "group_add",
        /// Removed from a group.
        GroupRemove => "group_remove",
        /// Incoming contact request.
        ContactRequest => "contact_request",
        /// Contact request accepted.
        ContactAccepted => "contact_accepted",
        /// A message was deleted.
        MessageDeleted => "message_deleted",
        /// A message was edited.
        MessageEdited => "message_edited",
        /// Operator or system notice.
        System => "system",
    }
}

wire_enum! {
    /// Read state of a notification.
    NotificationStatus {
        /// Not read yet.
        Unread => "unread",
        /// Read by its owner.
        Read => "read",
        /// Hidden from the unread list without being read.
        Archived => "archived",
    }
}

wire_enum! {
    /// Display priority of a notification.
    NotificationPriority {
        /// Low.
        Low => "low",
        /// Normal.
        Normal => "normal",
        /// High.
        High => "high",
        /// Urgent.
        Urgent => "urgent",
    }
}

impl Default for NotificationPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A notification as persisted by the notification store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification id.
    pub id: NotificationId,
    /// Owner.
    #[serde(rename = "userId")]
    pub user: UserId,
    /// What it is about.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Short headline.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Free-form references (message, conversation, sender).
    pub data: Value,
    /// Where a client should navigate when it is opened.
    pub action_url: Option<String>,
    /// Display priority.
    pub priority: NotificationPriority,
    /// Read state.
    pub status: NotificationStatus,
    /// When it was read.
    pub read_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// After this the notification is no longer listed.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Whether it has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Input to [`crate::NotificationStore::insert`].
#[derive(Clone, Debug)]
pub struct NewNotification {
    /// Owner.
    pub user: UserId,
    /// What it is about.
    pub kind: NotificationKind,
    /// Short headline.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Free-form references.
    pub data: Value,
    /// Navigation target.
    pub action_url: Option<String>,
    /// Display priority.
    pub priority: NotificationPriority,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewNotification {
    /// Normal-priority notification with no data, link or expiry.
    pub fn new(user: UserId, kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user,
            kind,
            title: title.into(),
            message: message.into(),
            data: Value::Object(serde_json::Map::new()),
            action_url: None,
            priority: NotificationPriority::Normal,
            expires_at: None,
        }
    }

    /// Check title and body lengths.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title is required".into());
        }
        if self.title.chars().count() > NOTIFICATION_TITLE_MAX {
            return Err(format!("title exceeds {NOTIFICATION_TITLE_MAX} characters"));
        }
        if self.message.trim().is_empty() {
            return Err("message is required".into());
        }
        if self.message.chars().count() > NOTIFICATION_MESSAGE_MAX {
            return Err(format!("message exceeds {NOTIFICATION_MESSAGE_MAX} characters"));
        }
        Ok(())
    }

    /// Persisted form, unread and stamped `created_at`.
    pub fn into_notification(self, created_at: DateTime<Utc>) -> Notification {
        Notification {
            id: NotificationId::new(),
            user: self.user,
            kind: self.kind,
            title: self.title,
            message: self.message,
            data: self.data,
            action_url: self.action_url,
            priority: self.priority,
            status: NotificationStatus::Unread,
            read_at: None,
            created_at,
            expires_at: self.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversation() -> Conversation {
        Conversation {
            id: ConversationId::from("c1"),
            participants: vec![UserId::from("a"), UserId::from("b"), UserId::from("c")],
            is_direct: false,
        }
    }

    #[test]
    fn participant_checks() {
        let conv = conversation();
        assert!(conv.has_participant(&UserId::from("b")));
        assert!(!conv.has_participant(&UserId::from("z")));
        let me = UserId::from("a");
        let others: Vec<&str> = conv.others(&me).map(UserId::as_str).collect();
        assert_eq!(others, vec!["b", "c"]);
    }

    #[test]
    fn message_serializes_camel_case() {
        let created_at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = StoredMessage {
            id: MessageId::from("m1"),
            sender: UserId::from("a"),
            recipient: None,
            conversation_id: ConversationId::from("c1"),
            content: "hi".into(),
            status: MessageStatus::Sent,
            edited: false,
            deleted: false,
            created_at,
            edited_at: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["conversationId"], json!("c1"));
        assert_eq!(value["status"], json!("sent"));
        assert!(value.get("recipient").is_none());
        assert!(value.get("editedAt").is_none());
    }

    #[test]
    fn status_names_round_trip() {
        for status in [MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Read] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("lost"), None);
        assert_eq!(PresenceStatus::Offline.as_str(), "offline");
    }

    #[test]
    fn notification_wire_shape() {
        let created_at = DateTime::parse_from_rfc3339("2026-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut new = NewNotification::new(UserId::from("a"), NotificationKind::GroupInvite, "Invite", "Join us");
        new.data = json!({ "groupId": "g1" });
        let n = new.into_notification(created_at);
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], json!("group_invite"));
        assert_eq!(value["userId"], json!("a"));
        assert_eq!(value["status"], json!("unread"));
        assert_eq!(value["priority"], json!("normal"));
        assert_eq!(value["data"]["groupId"], json!("g1"));
        assert!(value["readAt"].is_null());
        assert!(!n.is_expired(created_at));
    }

    #[test]
    fn notification_kind_names_parse() {
        for kind in NotificationKind::ALL {
            assert_eq!(NotificationKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(NotificationKind::parse("poke"), None);
        assert_eq!(NotificationStatus::parse("archived"), Some(NotificationStatus::Archived));
        assert_eq!(NotificationPriority::default().as_str(), "normal");
    }

    #[test]
    fn notification_lengths_are_checked() {
        let mut new = NewNotification::new(UserId::from("a"), NotificationKind::System, "t", "m");
        assert!(new.validate().is_ok());
        new.title = "x".repeat(NOTIFICATION_TITLE_MAX + 1);
        assert!(new.validate().unwrap_err().contains("title"));
        new.title = "t".into();
        new.message = " ".into();
        assert!(new.validate().is_err());
    }
}

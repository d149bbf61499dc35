//! Wire protocol: frames, event names and typed event parameters.
//!
//! ```text
//! inbound   { "id"?: <ack id>, "event": <name>, "data": {...} }
//! ack       { "ack": <ack id>, "data": { "ok": true, ... } }
//! outbound  { "event": <name>, "data": {...} }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::{ConversationId, MessageId, NotificationId, NotificationKind, UserId};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value, json};

use crate::errors::EventError;

/// A frame received from a client.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    /// Ack id; when present the server answers with an ack frame.
    #[serde(default)]
    pub id: Option<Value>,
    /// Event name.
    pub event: String,
    /// Event parameters.
    #[serde(default)]
    pub data: Value,
}

/// Serialize an outbound event frame.
pub fn event_frame(event: &str, data: &Value) -> Arc<String> {
    Arc::new(json!({ "event": event, "data": data }).to_string())
}

/// Serialize the ack for `id`. Successful object results gain `ok: true`.
pub fn ack_frame(id: &Value, result: &Result<Value, EventError>) -> String {
    let data = match result {
        Ok(Value::Object(map)) => {
            let mut map = map.clone();
            let _ = map.insert("ok".to_owned(), Value::Bool(true));
            Value::Object(map)
        }
        Ok(Value::Null) => json!({ "ok": true }),
        Ok(other) => json!({ "ok": true, "result": other }),
        Err(err) => err.to_ack_body(),
    };
    json!({ "ack": id, "data": data }).to_string()
}

// ── Event names ─────────────────────────────────────────────────────

/// Every inbound event the router understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `send-message`
    SendMessage,
    /// `message-read` / `message:read`
    MarkRead,
    /// `typing`
    Typing,
    /// `join-conversation`
    JoinConversation,
    /// `get-missed-messages`
    GetMissedMessages,
    /// `sync-messages`
    SyncMessages,
    /// `heartbeat`
    Heartbeat,
    /// `message:lock`
    Lock,
    /// `message:unlock`
    Unlock,
    /// `message:edit`
    Edit,
    /// `message:delete`
    Delete,
    /// `metrics:get`
    GetMetrics,
    /// `conversation:view`
    ViewConversation,
    /// `notifications:unread`
    UnreadNotifications,
    /// `notification:read`
    ReadNotification,
    /// `notifications:mark-all-read`
    ReadAllNotifications,
    /// `notification:delete`
    DeleteNotification,
    /// `notifications:subscribe`
    SubscribeNotifications,
    /// `notifications:unsubscribe`
    UnsubscribeNotifications,
}

impl EventKind {
    /// Every kind, in protocol order.
    pub const ALL: [Self; 19] = [
        Self::SendMessage,
        Self::MarkRead,
        Self::Typing,
        Self::JoinConversation,
        Self::GetMissedMessages,
        Self::SyncMessages,
        Self::Heartbeat,
        Self::Lock,
        Self::Unlock,
        Self::Edit,
        Self::Delete,
        Self::GetMetrics,
        Self::ViewConversation,
        Self::UnreadNotifications,
        Self::ReadNotification,
        Self::ReadAllNotifications,
        Self::DeleteNotification,
        Self::SubscribeNotifications,
        Self::UnsubscribeNotifications,
    ];

    /// Resolve a wire name. `message-read` and `message:read` are aliases.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "send-message" => Self::SendMessage,
            "message-read" | "message:read" => Self::MarkRead,
            "typing" => Self::Typing,
            "join-conversation" => Self::JoinConversation,
            "get-missed-messages" => Self::GetMissedMessages,
            "sync-messages" => Self::SyncMessages,
            "heartbeat" => Self::Heartbeat,
            "message:lock" => Self::Lock,
            "message:unlock" => Self::Unlock,
            "message:edit" => Self::Edit,
            "message:delete" => Self::Delete,
            "metrics:get" => Self::GetMetrics,
            "conversation:view" => Self::ViewConversation,
            "notifications:unread" => Self::UnreadNotifications,
            "notification:read" => Self::ReadNotification,
            "notifications:mark-all-read" => Self::ReadAllNotifications,
            "notification:delete" => Self::DeleteNotification,
            "notifications:subscribe" => Self::SubscribeNotifications,
            "notifications:unsubscribe" => Self::UnsubscribeNotifications,
            _ => return None,
        })
    }

    /// Canonical wire name (metrics labels, rate-limit keys).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "send-message",
            Self::MarkRead => "message-read",
            Self::Typing => "typing",
            Self::JoinConversation => "join-conversation",
            Self::GetMissedMessages => "get-missed-messages",
            Self::SyncMessages => "sync-messages",
            Self::Heartbeat => "heartbeat",
            Self::Lock => "message:lock",
            Self::Unlock => "message:unlock",
            Self::Edit => "message:edit",
            Self::Delete => "message:delete",
            Self::GetMetrics => "metrics:get",
            Self::ViewConversation => "conversation:view",
            Self::UnreadNotifications => "notifications:unread",
            Self::ReadNotification => "notification:read",
            Self::ReadAllNotifications => "notifications:mark-all-read",
            Self::DeleteNotification => "notification:delete",
            Self::SubscribeNotifications => "notifications:subscribe",
            Self::UnsubscribeNotifications => "notifications:unsubscribe",
        }
    }
}

// ── Typed parameters ────────────────────────────────────────────────

/// `send-message`: either `to` (direct) or `conversationId`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    /// Direct-message recipient.
    #[serde(default)]
    pub to: Option<UserId>,
    /// Existing conversation.
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Message text.
    #[serde(default)]
    pub content: String,
}

/// `message-read`: one id or many.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadParams {
    /// Single message.
    #[serde(default)]
    pub message_id: Option<MessageId>,
    /// Bulk form.
    #[serde(default)]
    pub message_ids: Option<Vec<MessageId>>,
}

impl MarkReadParams {
    /// Requested ids, deduplicated, in request order.
    pub fn ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = Vec::new();
        for id in self.message_id.iter().chain(self.message_ids.iter().flatten()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// `typing`, `join-conversation`, `conversation:view`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationParams {
    /// Target conversation.
    pub conversation_id: ConversationId,
}

/// `get-missed-messages`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedMessagesParams {
    /// Lower bound (exclusive).
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub since: Option<DateTime<Utc>>,
    /// Alias of `since`.
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub last_sync: Option<DateTime<Utc>>,
}

/// `sync-messages`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessagesParams {
    /// Conversation to sync.
    pub conversation_id: ConversationId,
    /// Only messages after this time.
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub since: Option<DateTime<Utc>>,
    /// Page size.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `heartbeat`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatParams {
    /// Client clock at send time, epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// `message:lock`, `message:unlock`, `message:delete`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    /// Target message.
    pub message_id: MessageId,
}

/// `message:edit`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditParams {
    /// Target message.
    pub message_id: MessageId,
    /// Replacement text.
    #[serde(default)]
    pub content: String,
}

/// `notification:read`, `notification:delete`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRef {
    /// Target notification.
    pub notification_id: NotificationId,
}

/// `notifications:subscribe`, `notifications:unsubscribe`.
#[derive(Clone, Debug, Deserialize)]
pub struct NotificationTypesParams {
    /// Notification types to (un)subscribe.
    pub types: Vec<NotificationKind>,
}

/// A parsed inbound event. Dispatched through one exhaustive `match`.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// Persist and deliver a message.
    SendMessage(SendMessageParams),
    /// Mark messages read.
    MarkRead(MarkReadParams),
    /// Typing indicator.
    Typing(ConversationParams),
    /// Join a conversation room.
    JoinConversation(ConversationParams),
    /// Messages missed while away.
    GetMissedMessages(MissedMessagesParams),
    /// Recent page of a conversation.
    SyncMessages(SyncMessagesParams),
    /// Liveness + latency sample.
    Heartbeat(HeartbeatParams),
    /// Acquire an edit lock.
    Lock(MessageRef),
    /// Release an edit lock.
    Unlock(MessageRef),
    /// Edit message content.
    Edit(EditParams),
    /// Soft-delete a message.
    Delete(MessageRef),
    /// Caller's latency metrics.
    GetMetrics,
    /// Record that the caller looked at a conversation.
    ViewConversation(ConversationParams),
    /// Unread notifications and their count.
    UnreadNotifications,
    /// Mark one notification read.
    ReadNotification(NotificationRef),
    /// Mark every notification read.
    ReadAllNotifications,
    /// Delete one notification.
    DeleteNotification(NotificationRef),
    /// Join notification-type rooms.
    SubscribeNotifications(NotificationTypesParams),
    /// Leave notification-type rooms.
    UnsubscribeNotifications(NotificationTypesParams),
}

impl ClientEvent {
    /// Decode `data` for `kind`. A missing or `null` payload reads as `{}`.
    pub fn parse(kind: EventKind, data: Value) -> Result<Self, EventError> {
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Ok(match kind {
            EventKind::SendMessage => Self::SendMessage(decode(data)?),
            EventKind::MarkRead => Self::MarkRead(decode(data)?),
            EventKind::Typing => Self::Typing(decode(data)?),
            EventKind::JoinConversation => Self::JoinConversation(decode(data)?),
            EventKind::GetMissedMessages => Self::GetMissedMessages(decode(data)?),
            EventKind::SyncMessages => Self::SyncMessages(decode(data)?),
            EventKind::Heartbeat => Self::Heartbeat(decode(data)?),
            EventKind::Lock => Self::Lock(decode(data)?),
            EventKind::Unlock => Self::Unlock(decode(data)?),
            EventKind::Edit => Self::Edit(decode(data)?),
            EventKind::Delete => Self::Delete(decode(data)?),
            EventKind::GetMetrics => Self::GetMetrics,
            EventKind::ViewConversation => Self::ViewConversation(decode(data)?),
            EventKind::UnreadNotifications => Self::UnreadNotifications,
            EventKind::ReadNotification => Self::ReadNotification(decode(data)?),
            EventKind::ReadAllNotifications => Self::ReadAllNotifications,
            EventKind::DeleteNotification => Self::DeleteNotification(decode(data)?),
            EventKind::SubscribeNotifications => Self::SubscribeNotifications(decode(data)?),
            EventKind::UnsubscribeNotifications => Self::UnsubscribeNotifications(decode(data)?),
        })
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, EventError> {
    serde_json::from_value(data).map_err(|e| EventError::invalid(format!("invalid parameters: {e}")))
}

/// Accepts RFC 3339 strings or epoch milliseconds.
fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Millis(ms)) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("timestamp {ms} out of range"))),
        Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|at| Some(at.with_timezone(&Utc)))
            .map_err(|e| D::Error::custom(format!("invalid timestamp '{text}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn frame_with_ack_id() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"id":7,"event":"typing","data":{"conversationId":"c1"}}"#)
                .unwrap();
        assert_eq!(frame.id, Some(json!(7)));
        assert_eq!(frame.event, "typing");
        assert_eq!(frame.data["conversationId"], "c1");
    }

    #[test]
    fn frame_without_data() {
        let frame: InboundFrame = serde_json::from_str(r#"{"event":"metrics:get"}"#).unwrap();
        assert!(frame.id.is_none());
        assert!(frame.data.is_null());
    }

    #[test]
    fn frame_without_event_is_rejected() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn ack_success_gains_ok() {
        let ack = ack_frame(&json!("r1"), &Ok(json!({"id": "m1"})));
        let parsed: Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(parsed["ack"], "r1");
        assert_eq!(parsed["data"]["ok"], true);
        assert_eq!(parsed["data"]["id"], "m1");
    }

    #[test]
    fn ack_failure_uses_error_body() {
        let ack = ack_frame(&json!(3), &Err(EventError::NotFound("message not found".into())));
        let parsed: Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(parsed["ack"], 3);
        assert_eq!(parsed["data"]["ok"], false);
        assert_eq!(parsed["data"]["code"], "NOT_FOUND");
        assert_eq!(parsed["data"]["error"], "message not found");
    }

    #[test]
    fn event_frame_shape() {
        let frame = event_frame("typing", &json!({"from": "alice"}));
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event"], "typing");
        assert_eq!(parsed["data"]["from"], "alice");
    }

    #[test]
    fn read_aliases_resolve_to_one_kind() {
        assert_eq!(EventKind::parse("message-read"), Some(EventKind::MarkRead));
        assert_eq!(EventKind::parse("message:read"), Some(EventKind::MarkRead));
        assert_eq!(EventKind::parse("message:explode"), None);
    }

    #[test]
    fn every_canonical_name_parses_back() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn mark_read_merges_single_and_bulk() {
        let params: MarkReadParams =
            serde_json::from_value(json!({"messageId": "a", "messageIds": ["b", "a", "c"]}))
                .unwrap();
        let ids: Vec<String> = params.ids().into_iter().map(MessageId::into_inner).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn timestamps_accept_millis_and_rfc3339() {
        let p: MissedMessagesParams =
            serde_json::from_value(json!({"since": 1_700_000_000_000_i64})).unwrap();
        assert_eq!(p.since.unwrap().timestamp_millis(), 1_700_000_000_000);

        let p: MissedMessagesParams =
            serde_json::from_value(json!({"lastSync": "2026-01-02T03:04:05Z"})).unwrap();
        assert!(p.since.is_none());
        assert_eq!(p.last_sync.unwrap().to_rfc3339(), "2026-01-02T03:04:05+00:00");

        assert!(serde_json::from_value::<MissedMessagesParams>(json!({"since": "soon"})).is_err());
    }

    #[test]
    fn null_data_reads_as_empty_object() {
        assert_matches!(
            ClientEvent::parse(EventKind::GetMissedMessages, Value::Null),
            Ok(ClientEvent::GetMissedMessages(p)) if p.since.is_none()
        );
    }

    #[test]
    fn notification_types_must_be_known() {
        assert_matches!(
            ClientEvent::parse(EventKind::SubscribeNotifications, json!({"types": ["mention", "group_add"]})),
            Ok(ClientEvent::SubscribeNotifications(p)) if p.types == vec![NotificationKind::Mention, NotificationKind::GroupAdd]
        );
        let err = ClientEvent::parse(EventKind::SubscribeNotifications, json!({"types": "mention"})).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert!(ClientEvent::parse(EventKind::UnsubscribeNotifications, json!({"types": ["poke"]})).is_err());
    }

    #[test]
    fn missing_required_field_is_invalid_params() {
        let err = ClientEvent::parse(EventKind::Lock, json!({})).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }
}

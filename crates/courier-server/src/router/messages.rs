//! Message events: send, read receipts, missed/sync queries, edit, delete.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{ConversationId, MessageStatus, MissedQuery, NewMessage, UserId};
use courier_state::{QueuedMessage, bounded};
use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{load_message, participant_conversation, to_payload};
use crate::connection::ClientConnection;
use crate::context::DeliveryContext;
use crate::errors::EventError;
use crate::metrics::OFFLINE_ENQUEUED_TOTAL;
use crate::protocol::{EditParams, MarkReadParams, MessageRef, MissedMessagesParams, SendMessageParams, SyncMessagesParams};
use crate::rooms::conversation_room;

use super::lifecycle::flush_to_identity;

fn validate_content(ctx: &DeliveryContext, content: &str) -> Result<(), EventError> {
    if content.trim().is_empty() {
        return Err(EventError::invalid("content must not be empty"));
    }
    let max = ctx.config.max_content_chars;
    if content.chars().count() > max {
        return Err(EventError::invalid(format!(
            "content exceeds {max} characters"
        )));
    }
    Ok(())
}

/// Emit live when `user` is reachable, otherwise queue for reconnect.
///
/// A recipient that comes online between the reachability check and the
/// enqueue is caught by a second check followed by a flush.
pub(super) async fn deliver_or_enqueue(ctx: &DeliveryContext, user: &UserId, event: &str, payload: &Value) {
    if ctx.registry.is_reachable(user).await {
        let _ = ctx.registry.emit_to_identity(user, event, payload);
        return;
    }
    let queued = QueuedMessage::new(payload.clone());
    match bounded(
        "queue.enqueue",
        ctx.config.store_timeout,
        ctx.queue.enqueue(user, queued),
    )
    .await
    {
        Ok(()) => {
            counter!(OFFLINE_ENQUEUED_TOTAL).increment(1);
            debug!(user_id = %user, event, "recipient unreachable, message queued");
            if ctx.registry.is_reachable(user).await {
                let _ = flush_to_identity(ctx, user).await;
            }
        }
        Err(error) => warn!(user_id = %user, %error, "failed to queue message"),
    }
}

pub(super) async fn send_message(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: SendMessageParams,
) -> Result<Value, EventError> {
    validate_content(ctx, &params.content)?;
    let sender = conn.user_id();

    let conversation = match (params.conversation_id, params.to) {
        (Some(id), _) => participant_conversation(ctx, &id, sender).await?,
        (None, Some(to)) => {
            if &to == sender {
                return Err(EventError::invalid("cannot send a message to yourself"));
            }
            let recipient = ctx
                .store_call("users.find_by_id", ctx.stores.users.find_by_id(&to))
                .await?
                .ok_or_else(|| EventError::NotFound("recipient not found".into()))?;
            let conversation = ctx
                .store_call(
                    "conversations.find_or_create_direct",
                    ctx.stores.conversations.find_or_create_direct(sender, &recipient.id),
                )
                .await?;
            let room = conversation_room(&conversation.id);
            let _ = ctx.registry.join_identity(sender, &room);
            let _ = ctx.registry.join_identity(&recipient.id, &room);
            conversation
        }
        (None, None) => {
            return Err(EventError::invalid("either `to` or `conversationId` is required"));
        }
    };

    let recipient = if conversation.is_direct {
        conversation.others(sender).next().cloned()
    } else {
        None
    };
    let message = ctx
        .store_call(
            "messages.create",
            ctx.stores.messages.create(NewMessage {
                sender: sender.clone(),
                recipient,
                conversation_id: conversation.id.clone(),
                content: params.content,
            }),
        )
        .await?;
    let payload = to_payload(&message)?;

    let _ = ctx.registry.emit_to_identity(sender, "message:new", &payload);
    for participant in conversation.others(sender) {
        deliver_or_enqueue(ctx, participant, "message:new", &payload).await;
    }
    debug!(message_id = %message.id, conversation_id = %conversation.id, "message sent");
    Ok(json!({ "id": message.id, "message": payload }))
}

pub(super) async fn mark_read(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: MarkReadParams,
) -> Result<Value, EventError> {
    let ids = params.ids();
    if ids.is_empty() {
        return Err(EventError::invalid("messageId or messageIds is required"));
    }
    let reader = conn.user_id();

    // Authorize every message before touching any of them.
    let mut messages = Vec::with_capacity(ids.len());
    let mut participation: HashMap<ConversationId, bool> = HashMap::new();
    for id in &ids {
        let message = load_message(ctx, id).await?;
        let allowed = if message.recipient.as_ref() == Some(reader) {
            true
        } else if let Some(known) = participation.get(&message.conversation_id) {
            *known
        } else {
            let ok = participant_conversation(ctx, &message.conversation_id, reader)
                .await
                .is_ok();
            let _ = participation.insert(message.conversation_id.clone(), ok);
            ok
        };
        if !allowed {
            return Err(EventError::Forbidden(
                "not allowed to mark this message as read".into(),
            ));
        }
        messages.push(message);
    }

    let count = ctx
        .store_call(
            "messages.update_status",
            ctx.stores.messages.update_status(&ids, MessageStatus::Read),
        )
        .await?;

    for message in messages
        .iter()
        .filter(|m| m.status != MessageStatus::Read && &m.sender != reader)
    {
        let _ = ctx.registry.emit_to_identity(
            &message.sender,
            "message:read",
            &json!({
                "messageId": message.id,
                "readBy": reader,
                "conversationId": message.conversation_id,
            }),
        );
    }
    Ok(json!({ "count": count }))
}

pub(super) async fn get_missed_messages(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: MissedMessagesParams,
) -> Result<Value, EventError> {
    let user = conn.user_id();
    let Some(since) = params
        .since
        .or(params.last_sync)
        .or(conn.identity.last_seen)
    else {
        return Ok(json!({ "messages": [], "count": 0 }));
    };

    let conversations: Vec<ConversationId> = ctx
        .store_call(
            "conversations.for_participant",
            ctx.stores.conversations.for_participant(user),
        )
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();
    if conversations.is_empty() {
        return Ok(json!({ "messages": [], "count": 0 }));
    }

    let messages = ctx
        .store_call(
            "messages.find_since",
            ctx.stores.messages.find_since(MissedQuery {
                conversations,
                since,
                exclude_sender: user.clone(),
                limit: ctx.config.missed_messages_limit,
            }),
        )
        .await?;
    let count = messages.len();
    Ok(json!({ "messages": messages, "count": count }))
}

pub(super) async fn sync_messages(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: SyncMessagesParams,
) -> Result<Value, EventError> {
    let conversation = participant_conversation(ctx, &params.conversation_id, conn.user_id()).await?;
    let limit = params
        .limit
        .unwrap_or(ctx.config.sync_default_limit)
        .clamp(1, ctx.config.sync_max_limit);
    let messages = ctx
        .store_call(
            "messages.recent_in",
            ctx.stores.messages.recent_in(&conversation.id, params.since, limit),
        )
        .await?;
    let count = messages.len();
    Ok(json!({
        "conversationId": conversation.id,
        "messages": messages,
        "count": count,
    }))
}

/// Sender-only mutations are refused while another identity holds the lock.
fn ensure_mutable(
    ctx: &DeliveryContext,
    message: &courier_core::StoredMessage,
    user: &UserId,
    action: &str,
) -> Result<(), EventError> {
    if &message.sender != user {
        return Err(EventError::Forbidden(format!(
            "only the sender can {action} this message"
        )));
    }
    if message.deleted {
        return Err(EventError::invalid("message has been deleted"));
    }
    if let Some(holder) = ctx.conflicts.locked_by_other(&message.id, user) {
        return Err(EventError::Conflict {
            message: "message is locked by another user".into(),
            locked_by: Some(holder),
        });
    }
    Ok(())
}

/// Drop the caller's own lock after a mutation and tell the room.
fn release_own_lock(ctx: &DeliveryContext, message_id: &str, user: &UserId, room: &str) {
    if ctx.conflicts.unlock(message_id, user).is_ok() {
        let _ = ctx
            .registry
            .emit_to_room(room, "message:unlocked", &json!({ "messageId": message_id }));
    }
}

pub(super) async fn edit_message(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: EditParams,
) -> Result<Value, EventError> {
    validate_content(ctx, &params.content)?;
    let user = conn.user_id();
    let message = load_message(ctx, &params.message_id).await?;
    ensure_mutable(ctx, &message, user, "edit")?;

    let updated = ctx
        .store_call(
            "messages.update_content",
            ctx.stores.messages.update_content(&message.id, &params.content),
        )
        .await?;
    let room = conversation_room(&updated.conversation_id);
    release_own_lock(ctx, &updated.id, user, &room);

    let payload = to_payload(&updated)?;
    let _ = ctx.registry.emit_to_room(&room, "message:updated", &payload);
    Ok(json!({ "message": payload }))
}

pub(super) async fn delete_message(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: MessageRef,
) -> Result<Value, EventError> {
    let user = conn.user_id();
    let message = load_message(ctx, &params.message_id).await?;
    ensure_mutable(ctx, &message, user, "delete")?;

    let deleted = ctx
        .store_call("messages.mark_deleted", ctx.stores.messages.mark_deleted(&message.id))
        .await?;
    let room = conversation_room(&deleted.conversation_id);
    release_own_lock(ctx, &deleted.id, user, &room);

    let _ = ctx.registry.emit_to_room(
        &room,
        "message:deleted",
        &json!({ "messageId": deleted.id, "conversationId": deleted.conversation_id }),
    );
    Ok(json!({ "messageId": deleted.id }))
}

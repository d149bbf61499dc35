//! Conversation events: typing indicators, room joins and view tracking.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use super::participant_conversation;
use crate::connection::ClientConnection;
use crate::context::DeliveryContext;
use crate::errors::EventError;
use crate::protocol::ConversationParams;
use crate::rooms::conversation_room;

pub(super) async fn typing(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: ConversationParams,
) -> Result<Value, EventError> {
    let conversation_id = params.conversation_id;
    let room = conversation_room(&conversation_id);

    // Membership is normally established at connect; fall back to the store
    // for conversations created since.
    if !ctx.registry.is_member(&room, &conn.id) {
        let _ = participant_conversation(ctx, &conversation_id, conn.user_id()).await?;
        let _ = ctx.registry.join_room(&conn.id, &room);
    }

    let data = json!({ "from": conn.user_id(), "conversationId": conversation_id });
    let _ = ctx
        .registry
        .emit_to_room_except(&room, &conn.id, "typing", &data);

    let registry = Arc::clone(&ctx.registry);
    let except = conn.id.clone();
    conn.typing
        .touch(&conversation_id, ctx.config.typing_quiet, move || {
            let _ = registry.emit_to_room_except(&room, &except, "typing-stopped", &data);
        });
    Ok(Value::Null)
}

pub(super) async fn join_conversation(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: ConversationParams,
) -> Result<Value, EventError> {
    let conversation = participant_conversation(ctx, &params.conversation_id, conn.user_id()).await?;
    let _ = ctx
        .registry
        .join_room(&conn.id, &conversation_room(&conversation.id));
    Ok(json!({ "conversationId": conversation.id }))
}

/// Record when the caller last looked at a conversation.
pub(super) async fn view_conversation(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: ConversationParams,
) -> Result<Value, EventError> {
    let user = conn.user_id();
    let conversation = participant_conversation(ctx, &params.conversation_id, user).await?;
    let viewed_at = Utc::now();
    let previous = ctx
        .store_call(
            "users.record_conversation_view",
            ctx.stores.users.record_conversation_view(user, &conversation.id, viewed_at),
        )
        .await?;
    debug!(conversation_id = %conversation.id, "conversation viewed");
    Ok(json!({
        "conversationId": conversation.id,
        "viewedAt": viewed_at.to_rfc3339(),
        "previousViewedAt": previous.map(|at| at.to_rfc3339()),
    }))
}

//! Cooperative edit locks on messages.

use std::sync::Arc;

use courier_state::{LockOutcome, UnlockError};
use serde_json::{Value, json};
use tracing::debug;

use super::{load_message, participant_conversation};
use crate::connection::ClientConnection;
use crate::context::DeliveryContext;
use crate::errors::EventError;
use crate::protocol::MessageRef;
use crate::rooms::conversation_room;

pub(super) async fn lock(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: MessageRef,
) -> Result<Value, EventError> {
    let user = conn.user_id();
    let message = load_message(ctx, &params.message_id).await?;
    let conversation = participant_conversation(ctx, &message.conversation_id, user).await?;

    match ctx.conflicts.lock(&message.id, user, &conn.id) {
        LockOutcome::Acquired => {
            debug!(message_id = %message.id, user_id = %user, "lock acquired");
            let _ = ctx.registry.emit_to_room(
                &conversation_room(&conversation.id),
                "message:locked",
                &json!({ "messageId": message.id, "lockedBy": user }),
            );
            Ok(json!({ "messageId": message.id, "lockedBy": user }))
        }
        LockOutcome::Held { holder } => Err(EventError::Conflict {
            message: "message is locked by another user".into(),
            locked_by: Some(holder),
        }),
    }
}

pub(super) async fn unlock(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: MessageRef,
) -> Result<Value, EventError> {
    let released = ctx
        .conflicts
        .unlock(&params.message_id, conn.user_id())
        .map_err(|e| match e {
            UnlockError::NoLock => EventError::NotFound(e.to_string()),
            UnlockError::NotHolder { .. } => EventError::Forbidden(e.to_string()),
        })?;

    // The lock is gone either way; the broadcast needs the message's room.
    match load_message(ctx, &params.message_id).await {
        Ok(message) => {
            let _ = ctx.registry.emit_to_room(
                &conversation_room(&message.conversation_id),
                "message:unlocked",
                &json!({ "messageId": message.id }),
            );
        }
        Err(e) => debug!(message_id = %released.resource, error = %e, "unlocked message not found"),
    }
    Ok(json!({ "messageId": params.message_id }))
}

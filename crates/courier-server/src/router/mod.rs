//! Event dispatch.
//!
//! Every inbound frame goes through the same chain: parse, log entry,
//! rate-limit check, typed parameter parse, handler under a timeout with
//! panic capture, log exit. Handlers live in the submodules and are reached
//! through one exhaustive `match` over [`ClientEvent`].

mod conversations;
mod heartbeat;
mod lifecycle;
mod locks;
mod messages;
mod notifications;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use courier_core::{
    Conversation, ConversationId, MessageId, NewNotification, Notification, NotificationKind, StoredMessage,
    UserId,
};
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, instrument, warn};

use crate::connection::ClientConnection;
use crate::context::DeliveryContext;
use crate::errors::{EventError, INVALID_FRAME};
use crate::metrics::{EVENT_DURATION_SECONDS, EVENT_ERRORS_TOTAL, EVENTS_TOTAL, RATE_LIMITED_TOTAL};
use crate::protocol::{ClientEvent, EventKind, InboundFrame, ack_frame};

/// Message sent with every `rate-limit-exceeded` event.
pub const RATE_LIMIT_MESSAGE: &str = "Too many requests, please slow down";

/// Routes client events to their handlers.
#[derive(Clone, Debug)]
pub struct DeliveryRouter {
    ctx: Arc<DeliveryContext>,
}

impl DeliveryRouter {
    /// Router over `ctx`.
    pub fn new(ctx: Arc<DeliveryContext>) -> Self {
        Self { ctx }
    }

    /// Shared handler context.
    pub fn context(&self) -> &Arc<DeliveryContext> {
        &self.ctx
    }

    /// Handle one text frame. Returns the serialized ack when the frame
    /// carried an ack id.
    pub async fn handle_frame(&self, conn: &Arc<ClientConnection>, text: &str) -> Option<String> {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id = %conn.id, error = %e, "invalid frame received");
                let _ = conn.send_event(
                    "error",
                    &json!({ "code": INVALID_FRAME, "message": format!("invalid frame: {e}") }),
                );
                return None;
            }
        };
        let InboundFrame { id, event, data } = frame;
        let result = self.dispatch(conn, &event, data).await;
        id.map(|id| ack_frame(&id, &result))
    }

    /// Run the handler chain for one event.
    #[instrument(skip_all, fields(conn_id = %conn.id, user_id = %conn.user_id(), event = name))]
    pub async fn dispatch(
        &self,
        conn: &Arc<ClientConnection>,
        name: &str,
        data: Value,
    ) -> Result<Value, EventError> {
        let Some(kind) = EventKind::parse(name) else {
            warn!("unknown event");
            counter!(EVENT_ERRORS_TOTAL, "event" => "unknown", "code" => "UNKNOWN_EVENT")
                .increment(1);
            return Err(EventError::UnknownEvent {
                name: name.to_owned(),
            });
        };
        let event = kind.as_str();
        debug!("dispatching event");
        counter!(EVENTS_TOTAL, "event" => event).increment(1);

        if !self.ctx.limiters.check(conn.user_id(), kind) {
            counter!(RATE_LIMITED_TOTAL, "event" => event).increment(1);
            warn!("rate limit exceeded");
            let _ = conn.send_event(
                "rate-limit-exceeded",
                &json!({ "event": event, "message": RATE_LIMIT_MESSAGE }),
            );
            return Err(EventError::RateLimited { event });
        }

        let start = Instant::now();
        let result = match ClientEvent::parse(kind, data) {
            Ok(parsed) => self.run_guarded(conn, kind, parsed).await,
            Err(e) => Err(e),
        };
        histogram!(EVENT_DURATION_SECONDS, "event" => event).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(_) => debug!(elapsed_ms = start.elapsed().as_millis() as u64, "event handled"),
            Err(e) => {
                counter!(EVENT_ERRORS_TOTAL, "event" => event, "code" => e.code()).increment(1);
                if matches!(e, EventError::Internal(_) | EventError::Timeout { .. }) {
                    error!(code = e.code(), error = %e, "event failed");
                } else {
                    debug!(code = e.code(), error = %e, "event rejected");
                }
            }
        }
        result
    }

    async fn run_guarded(
        &self,
        conn: &Arc<ClientConnection>,
        kind: EventKind,
        event: ClientEvent,
    ) -> Result<Value, EventError> {
        let guarded = AssertUnwindSafe(self.route(conn, event)).catch_unwind();
        match tokio::time::timeout(self.ctx.config.handler_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                error!(panic = %detail, "event handler panicked");
                Err(EventError::Internal(format!("handler panicked: {detail}")))
            }
            Err(_) => Err(EventError::Timeout {
                operation: kind.as_str(),
            }),
        }
    }

    async fn route(&self, conn: &Arc<ClientConnection>, event: ClientEvent) -> Result<Value, EventError> {
        let ctx = &*self.ctx;
        match event {
            ClientEvent::SendMessage(p) => messages::send_message(ctx, conn, p).await,
            ClientEvent::MarkRead(p) => messages::mark_read(ctx, conn, p).await,
            ClientEvent::GetMissedMessages(p) => messages::get_missed_messages(ctx, conn, p).await,
            ClientEvent::SyncMessages(p) => messages::sync_messages(ctx, conn, p).await,
            ClientEvent::Edit(p) => messages::edit_message(ctx, conn, p).await,
            ClientEvent::Delete(p) => messages::delete_message(ctx, conn, p).await,
            ClientEvent::Typing(p) => conversations::typing(ctx, conn, p).await,
            ClientEvent::JoinConversation(p) => conversations::join_conversation(ctx, conn, p).await,
            ClientEvent::ViewConversation(p) => conversations::view_conversation(ctx, conn, p).await,
            ClientEvent::Lock(p) => locks::lock(ctx, conn, p).await,
            ClientEvent::Unlock(p) => locks::unlock(ctx, conn, p).await,
            ClientEvent::Heartbeat(p) => Ok(heartbeat::heartbeat(ctx, conn, &p)),
            ClientEvent::GetMetrics => Ok(heartbeat::get_metrics(ctx, conn)),
            ClientEvent::UnreadNotifications => notifications::unread(ctx, conn).await,
            ClientEvent::ReadNotification(p) => notifications::read(ctx, conn, p).await,
            ClientEvent::ReadAllNotifications => notifications::read_all(ctx, conn).await,
            ClientEvent::DeleteNotification(p) => notifications::delete(ctx, conn, p).await,
            ClientEvent::SubscribeNotifications(p) => Ok(notifications::subscribe(ctx, conn, &p)),
            ClientEvent::UnsubscribeNotifications(p) => Ok(notifications::unsubscribe(ctx, conn, &p)),
        }
    }

    /// Connect-time work: register, presence transition, queue flush, then
    /// release the connection for live traffic. Returns whether this was the
    /// identity's first connection.
    pub async fn on_connect(&self, conn: &Arc<ClientConnection>) -> bool {
        lifecycle::on_connect(&self.ctx, conn).await
    }

    /// Disconnect cleanup. Every step runs even if an earlier one failed.
    pub async fn on_disconnect(&self, conn: &Arc<ClientConnection>) {
        lifecycle::on_disconnect(&self.ctx, conn).await;
    }

    /// Store a notification and push it to the owner's live connections.
    pub async fn notify(&self, notification: NewNotification) -> Result<Notification, EventError> {
        notifications::notify(&self.ctx, notification).await
    }

    /// Broadcast to connections subscribed to `kind`. Returns local deliveries.
    pub fn announce(&self, kind: NotificationKind, data: &Value) -> usize {
        notifications::announce(&self.ctx, kind, data)
    }
}

// ── Shared lookups ──────────────────────────────────────────────────

async fn load_message(ctx: &DeliveryContext, id: &MessageId) -> Result<StoredMessage, EventError> {
    ctx.store_call("messages.find_by_id", ctx.stores.messages.find_by_id(id))
        .await?
        .ok_or_else(|| EventError::NotFound("message not found".into()))
}

async fn load_conversation(
    ctx: &DeliveryContext,
    id: &ConversationId,
) -> Result<Conversation, EventError> {
    ctx.store_call("conversations.find_by_id", ctx.stores.conversations.find_by_id(id))
        .await?
        .ok_or_else(|| EventError::NotFound("conversation not found".into()))
}

async fn participant_conversation(
    ctx: &DeliveryContext,
    id: &ConversationId,
    user: &UserId,
) -> Result<Conversation, EventError> {
    let conversation = load_conversation(ctx, id).await?;
    if conversation.has_participant(user) {
        Ok(conversation)
    } else {
        Err(EventError::Forbidden(
            "not a participant of this conversation".into(),
        ))
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, EventError> {
    serde_json::to_value(value).map_err(|e| EventError::Internal(e.to_string()))
}

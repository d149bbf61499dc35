//! Connect and disconnect sequences, presence broadcasts, queue flushes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::{MessageId, PresenceStatus, UserId};
use courier_state::QueuedMessage;
use metrics::counter;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::context::DeliveryContext;
use crate::metrics::OFFLINE_FLUSHED_TOTAL;
use crate::protocol::event_frame;
use crate::rooms::conversation_room;

pub(super) async fn on_connect(ctx: &DeliveryContext, conn: &Arc<ClientConnection>) -> bool {
    let user = conn.user_id();
    let first = ctx.registry.register(Arc::clone(conn)).await;

    let _ = conn.send_direct(event_frame(
        "connection:established",
        &json!({
            "connectionId": conn.id,
            "userId": user,
            "serverTime": Utc::now().to_rfc3339(),
        }),
    ));

    if first {
        info!(conn_id = %conn.id, user_id = %user, "identity online");
        let now = Utc::now();
        persist_presence(ctx, user, PresenceStatus::Online, now).await;
        broadcast_status(ctx, user, PresenceStatus::Online, now).await;

        if let Some(messages) = take_queue(ctx, user).await {
            let count = messages.len();
            let _ = conn.send_direct(event_frame(
                "queued-messages",
                &json!({ "messages": messages, "count": count }),
            ));
            counter!(OFFLINE_FLUSHED_TOTAL).increment(count as u64);
            info!(conn_id = %conn.id, user_id = %user, count, "flushed offline queue");
        }
    }

    conn.release();
    first
}

/// Tear down a connection. It leaves the registry and its rooms before any
/// awaited cleanup, so traffic routed meanwhile sees it gone and queues.
pub(super) async fn on_disconnect(ctx: &DeliveryContext, conn: &Arc<ClientConnection>) {
    let user = conn.user_id();
    let last = ctx.registry.unregister(conn).await;
    let _ = ctx.heartbeats.remove(&conn.id);

    for conversation in conn.typing.cancel_all() {
        let _ = ctx.registry.emit_to_room(
            &conversation_room(&conversation),
            "typing-stopped",
            &json!({ "from": user, "conversationId": conversation }),
        );
    }

    for lock in ctx.conflicts.release_connection_locks(&conn.id) {
        let message_id = MessageId::from(lock.resource.as_str());
        match ctx
            .store_call("messages.find_by_id", ctx.stores.messages.find_by_id(&message_id))
            .await
        {
            Ok(Some(message)) => {
                let _ = ctx.registry.emit_to_room(
                    &conversation_room(&message.conversation_id),
                    "message:unlocked",
                    &json!({ "messageId": message_id }),
                );
            }
            Ok(None) => debug!(%message_id, "released lock on missing message"),
            Err(e) => warn!(%message_id, error = %e, "could not announce released lock"),
        }
    }

    if last {
        info!(conn_id = %conn.id, user_id = %user, "identity offline");
        let now = Utc::now();
        persist_presence(ctx, user, PresenceStatus::Offline, now).await;
        broadcast_status(ctx, user, PresenceStatus::Offline, now).await;
    } else {
        debug!(conn_id = %conn.id, user_id = %user, "connection closed, identity still online");
    }
}

/// Drain `user`'s queue and emit it as one batch to every device.
pub(super) async fn flush_to_identity(ctx: &DeliveryContext, user: &UserId) -> usize {
    let Some(messages) = take_queue(ctx, user).await else {
        return 0;
    };
    let count = messages.len();
    let _ = ctx.registry.emit_to_identity(
        user,
        "queued-messages",
        &json!({ "messages": messages, "count": count }),
    );
    counter!(OFFLINE_FLUSHED_TOTAL).increment(count as u64);
    debug!(user_id = %user, count, "flushed offline queue to late arrival");
    count
}

/// Drain `user`'s queue. Not wrapped in the store timeout: the queue bounds
/// each of its own steps, and cutting a drain short after its removal
/// landed would lose what it read.
async fn take_queue(ctx: &DeliveryContext, user: &UserId) -> Option<Vec<QueuedMessage>> {
    match ctx.queue.dequeue_all(user).await {
        Ok(messages) if messages.is_empty() => None,
        Ok(messages) => Some(messages),
        Err(e) => {
            warn!(user_id = %user, error = %e, "failed to read offline queue");
            None
        }
    }
}

async fn persist_presence(
    ctx: &DeliveryContext,
    user: &UserId,
    status: PresenceStatus,
    at: DateTime<Utc>,
) {
    if let Err(e) = ctx
        .store_call(
            "users.update_presence",
            ctx.stores.users.update_presence(user, status, at),
        )
        .await
    {
        warn!(user_id = %user, status = status.as_str(), error = %e, "failed to persist presence");
    }
}

/// Tell reachable contacts about a presence transition.
async fn broadcast_status(
    ctx: &DeliveryContext,
    user: &UserId,
    status: PresenceStatus,
    at: DateTime<Utc>,
) {
    let contacts = match ctx
        .store_call("users.contacts_of", ctx.stores.users.contacts_of(user))
        .await
    {
        Ok(contacts) => contacts,
        Err(e) => {
            warn!(user_id = %user, error = %e, "contact lookup failed, skipping status broadcast");
            return;
        }
    };
    let payload = json!({
        "userId": user,
        "status": status.as_str(),
        "lastSeen": at.to_rfc3339(),
    });
    let mut notified = 0;
    for contact in &contacts {
        if ctx.registry.is_reachable(contact).await {
            let _ = ctx.registry.emit_to_identity(contact, "user-status", &payload);
            notified += 1;
        }
    }
    debug!(user_id = %user, status = status.as_str(), notified, "status broadcast");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::identity;
    use crate::config::ServerConfig;
    use crate::context::tests::make_context;
    use crate::router::messages::deliver_or_enqueue;
    use courier_core::{
        ConversationId, MessageStatus, MessageStore, MissedQuery, NewMessage, Stores, StoredMessage,
        UserStore,
    };
    use courier_state::{LocalPresence, MemoryQueue};
    use courier_store::MemoryStore;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (DeliveryContext, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for id in ["alice", "bob"] {
            let _ = store.add_user(id, id);
        }
        store.add_contacts(&UserId::from("alice"), &UserId::from("bob"));
        (make_context(Arc::clone(&store)), store)
    }

    fn client(user: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(ClientConnection::new(identity(user), tx)), rx)
    }

    fn events(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn named<'a>(evs: &'a [Value], name: &str) -> Vec<&'a Value> {
        evs.iter().filter(|e| e["event"] == name).collect()
    }

    #[tokio::test]
    async fn single_connection_presence_round_trip() {
        let (ctx, store) = setup();
        let (b, mut rb) = client("bob");
        assert!(on_connect(&ctx, &b).await);
        let _ = events(&mut rb);

        let (a, mut ra) = client("alice");
        assert!(on_connect(&ctx, &a).await);
        let evs = events(&mut ra);
        assert_eq!(evs[0]["event"], "connection:established");
        assert_eq!(evs[0]["data"]["userId"], "alice");
        assert!(!a.is_held());

        let online = events(&mut rb);
        let online = named(&online, "user-status");
        assert_eq!(online.len(), 1);
        assert_eq!(online[0]["data"]["status"], "online");
        assert_eq!(
            store.user(&UserId::from("alice")).unwrap().status,
            PresenceStatus::Online
        );

        on_disconnect(&ctx, &a).await;
        let offline = events(&mut rb);
        let offline = named(&offline, "user-status");
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0]["data"]["status"], "offline");
        assert!(!ctx.registry.is_reachable(&UserId::from("alice")).await);
        let stored = UserStore::find_by_id(&*store, &UserId::from("alice")).await.unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Offline);
        assert!(stored.last_seen.is_some());
    }

    #[tokio::test]
    async fn extra_devices_do_not_toggle_presence() {
        let (ctx, _store) = setup();
        let (b, mut rb) = client("bob");
        let _ = on_connect(&ctx, &b).await;

        let (a1, _r1) = client("alice");
        let (a2, _r2) = client("alice");
        assert!(on_connect(&ctx, &a1).await);
        assert!(!on_connect(&ctx, &a2).await);
        let _ = events(&mut rb);

        on_disconnect(&ctx, &a1).await;
        assert!(named(&events(&mut rb), "user-status").is_empty());
        assert!(ctx.registry.is_reachable(&UserId::from("alice")).await);

        on_disconnect(&ctx, &a2).await;
        assert_eq!(named(&events(&mut rb), "user-status").len(), 1);
    }

    #[tokio::test]
    async fn queue_is_flushed_once_before_live_traffic() {
        let (ctx, _store) = setup();
        ctx.queue
            .enqueue("alice", QueuedMessage::new(json!({"id": "m1", "content": "hi"})))
            .await
            .unwrap();

        let (a, mut ra) = client("alice");
        // Live traffic routed while the connect sequence runs is held.
        let _ = a.send_event("message:new", &json!({"id": "m2"}));
        let _ = on_connect(&ctx, &a).await;

        let evs = events(&mut ra);
        let names: Vec<&str> = evs.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["connection:established", "queued-messages", "message:new"]);
        assert_eq!(evs[1]["data"]["count"], 1);
        assert_eq!(evs[1]["data"]["messages"][0]["content"], "hi");
        assert!(evs[1]["data"]["messages"][0]["queuedAt"].is_string());
        assert_eq!(ctx.queue.size("alice").await.unwrap(), 0);

        let (a2, mut ra2) = client("alice");
        let _ = on_connect(&ctx, &a2).await;
        assert!(named(&events(&mut ra2), "queued-messages").is_empty());
    }

    #[tokio::test]
    async fn disconnect_releases_locks_and_typing() {
        let (ctx, store) = setup();
        let conv = store.add_conversation(&[UserId::from("alice"), UserId::from("bob")]);
        let message = courier_core::MessageStore::create(
            &*store,
            courier_core::NewMessage {
                sender: UserId::from("alice"),
                recipient: None,
                conversation_id: conv.id.clone(),
                content: "draft".into(),
            },
        )
        .await
        .unwrap();

        let (a, _ra) = client("alice");
        let (b, mut rb) = client("bob");
        let _ = on_connect(&ctx, &a).await;
        let _ = on_connect(&ctx, &b).await;
        let _ = events(&mut rb);

        let _ = ctx.conflicts.lock(&message.id, "alice", &a.id);
        a.typing.touch(&conv.id, std::time::Duration::from_secs(60), || {});

        on_disconnect(&ctx, &a).await;
        let evs = events(&mut rb);
        assert_eq!(named(&evs, "typing-stopped").len(), 1);
        let unlocked = named(&evs, "message:unlocked");
        assert_eq!(unlocked.len(), 1);
        assert_eq!(unlocked[0]["data"]["messageId"], message.id.as_str());
        assert!(!ctx.conflicts.is_locked(&message.id));
    }

    type StoreResult<T> = courier_core::errors::Result<T>;

    /// Message store whose lookups stall, widening the disconnect cleanup.
    struct SlowMessages(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl MessageStore for SlowMessages {
        async fn create(&self, message: NewMessage) -> StoreResult<StoredMessage> {
            MessageStore::create(&*self.0, message).await
        }
        async fn find_by_id(&self, id: &MessageId) -> StoreResult<Option<StoredMessage>> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            MessageStore::find_by_id(&*self.0, id).await
        }
        async fn update_status(&self, ids: &[MessageId], status: MessageStatus) -> StoreResult<usize> {
            MessageStore::update_status(&*self.0, ids, status).await
        }
        async fn update_content(&self, id: &MessageId, content: &str) -> StoreResult<StoredMessage> {
            MessageStore::update_content(&*self.0, id, content).await
        }
        async fn mark_deleted(&self, id: &MessageId) -> StoreResult<StoredMessage> {
            MessageStore::mark_deleted(&*self.0, id).await
        }
        async fn find_since(&self, query: MissedQuery) -> StoreResult<Vec<StoredMessage>> {
            MessageStore::find_since(&*self.0, query).await
        }
        async fn recent_in(
            &self,
            conversation: &ConversationId,
            since: Option<DateTime<Utc>>,
            limit: usize,
        ) -> StoreResult<Vec<StoredMessage>> {
            MessageStore::recent_in(&*self.0, conversation, since, limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn message_sent_during_disconnect_cleanup_is_queued() {
        let store = Arc::new(MemoryStore::new());
        for id in ["alice", "bob"] {
            let _ = store.add_user(id, id);
        }
        let conv = store.add_conversation(&[UserId::from("alice"), UserId::from("bob")]);
        let draft = MessageStore::create(
            &*store,
            NewMessage {
                sender: UserId::from("alice"),
                recipient: None,
                conversation_id: conv.id.clone(),
                content: "draft".into(),
            },
        )
        .await
        .unwrap();
        let mut stores = Stores::from_shared(Arc::clone(&store));
        stores.messages = Arc::new(SlowMessages(Arc::clone(&store)));
        let ctx = DeliveryContext::new(
            Arc::new(ServerConfig {
                store_timeout: Duration::from_secs(5),
                ..ServerConfig::default()
            }),
            stores,
            Arc::new(LocalPresence::new()),
            Arc::new(MemoryQueue::new(Duration::from_secs(3600))),
        );

        let (a, mut ra) = client("alice");
        let _ = on_connect(&ctx, &a).await;
        let _ = events(&mut ra);
        let _ = ctx.conflicts.lock(&draft.id, "alice", &a.id);

        let alice = UserId::from("alice");
        let send = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(!ctx.registry.is_reachable(&alice).await);
            deliver_or_enqueue(&ctx, &alice, "message:new", &json!({ "id": "m2" })).await;
        };
        let ((), ()) = tokio::join!(on_disconnect(&ctx, &a), send);

        assert!(named(&events(&mut ra), "message:new").is_empty());
        assert_eq!(ctx.queue.size("alice").await.unwrap(), 1);
        assert!(!ctx.conflicts.is_locked(&draft.id));
    }

    #[tokio::test]
    async fn late_flush_reaches_every_device() {
        let (ctx, _store) = setup();
        let (a, mut ra) = client("alice");
        let _ = on_connect(&ctx, &a).await;
        let _ = events(&mut ra);

        ctx.queue
            .enqueue("alice", QueuedMessage::new(json!({"id": "m1"})))
            .await
            .unwrap();
        assert_eq!(flush_to_identity(&ctx, &UserId::from("alice")).await, 1);
        assert_eq!(flush_to_identity(&ctx, &UserId::from("alice")).await, 0);
        assert_eq!(named(&events(&mut ra), "queued-messages").len(), 1);
    }
}

//! Notification events: unread listing, read/delete, type subscriptions,
//! plus the server-side `notify` and `announce` entry points.

use std::sync::Arc;

use courier_core::{NewNotification, Notification, NotificationKind};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::to_payload;
use crate::connection::ClientConnection;
use crate::context::DeliveryContext;
use crate::errors::EventError;
use crate::protocol::{NotificationRef, NotificationTypesParams};
use crate::rooms::notification_type_room;

/// Most notifications returned by `notifications:unread`.
pub const UNREAD_PAGE: usize = 50;

fn missing() -> EventError {
    EventError::NotFound("notification not found".into())
}

pub(super) async fn unread(ctx: &DeliveryContext, conn: &Arc<ClientConnection>) -> Result<Value, EventError> {
    let user = conn.user_id();
    let count = ctx
        .store_call("notifications.unread_count", ctx.stores.notifications.unread_count(user))
        .await?;
    let notifications = ctx
        .store_call(
            "notifications.unread",
            ctx.stores.notifications.unread(user, UNREAD_PAGE),
        )
        .await?;
    Ok(json!({ "count": count, "notifications": to_payload(&notifications)? }))
}

pub(super) async fn read(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: NotificationRef,
) -> Result<Value, EventError> {
    let user = conn.user_id();
    let id = params.notification_id;
    let changed = ctx
        .store_call("notifications.mark_read", ctx.stores.notifications.mark_read(user, &id))
        .await?;
    if !changed {
        return Err(missing());
    }
    let _ = ctx.registry.emit_to_identity(
        user,
        "notification:read-confirmed",
        &json!({ "notificationId": id }),
    );
    Ok(Value::Null)
}

pub(super) async fn read_all(ctx: &DeliveryContext, conn: &Arc<ClientConnection>) -> Result<Value, EventError> {
    let user = conn.user_id();
    let count = ctx
        .store_call("notifications.mark_all_read", ctx.stores.notifications.mark_all_read(user))
        .await?;
    let _ = ctx.registry.emit_to_identity(
        user,
        "notifications:all-read-confirmed",
        &json!({ "count": count }),
    );
    Ok(json!({ "count": count }))
}

pub(super) async fn delete(
    ctx: &DeliveryContext,
    conn: &Arc<ClientConnection>,
    params: NotificationRef,
) -> Result<Value, EventError> {
    let user = conn.user_id();
    let id = params.notification_id;
    let deleted = ctx
        .store_call("notifications.delete", ctx.stores.notifications.delete(user, &id))
        .await?;
    if !deleted {
        return Err(missing());
    }
    let _ = ctx.registry.emit_to_identity(
        user,
        "notification:deleted-confirmed",
        &json!({ "notificationId": id }),
    );
    Ok(Value::Null)
}

pub(super) fn subscribe(
    ctx: &DeliveryContext,
    conn: &ClientConnection,
    params: &NotificationTypesParams,
) -> Value {
    for kind in &params.types {
        let _ = ctx
            .registry
            .join_room(&conn.id, &notification_type_room(kind.as_str()));
    }
    info!(conn_id = %conn.id, types = ?params.types, "subscribed to notification types");
    json!({ "subscribedTo": params.types })
}

pub(super) fn unsubscribe(
    ctx: &DeliveryContext,
    conn: &ClientConnection,
    params: &NotificationTypesParams,
) -> Value {
    for kind in &params.types {
        let _ = ctx
            .registry
            .leave_room(&conn.id, &notification_type_room(kind.as_str()));
    }
    info!(conn_id = %conn.id, types = ?params.types, "unsubscribed from notification types");
    json!({ "unsubscribedFrom": params.types })
}

/// Persist a notification and push `notification:new` to every device of
/// its owner. Offline owners pick it up through `notifications:unread`.
pub(super) async fn notify(ctx: &DeliveryContext, notification: NewNotification) -> Result<Notification, EventError> {
    notification.validate().map_err(EventError::invalid)?;
    let stored = ctx
        .store_call("notifications.insert", ctx.stores.notifications.insert(notification))
        .await?;
    let delivered = ctx
        .registry
        .emit_to_identity(&stored.user, "notification:new", &to_payload(&stored)?);
    debug!(notification_id = %stored.id, user_id = %stored.user, delivered, "notification created");
    Ok(stored)
}

/// Emit `notification:broadcast` to every connection subscribed to `kind`.
pub(super) fn announce(ctx: &DeliveryContext, kind: NotificationKind, data: &Value) -> usize {
    ctx.registry.emit_to_room(
        &notification_type_room(kind.as_str()),
        "notification:broadcast",
        &json!({ "type": kind, "data": data }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::connection::tests::identity;
    use crate::context::tests::make_context;
    use assert_matches::assert_matches;
    use courier_core::{NotificationId, NotificationStatus, NotificationStore, UserId};
    use courier_store::MemoryStore;
    use tokio::sync::mpsc;

    async fn setup() -> (DeliveryContext, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for id in ["alice", "bob"] {
            let _ = store.add_user(id, id);
        }
        (make_context(Arc::clone(&store)), store)
    }

    async fn online(
        ctx: &DeliveryContext,
        user: &str,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(ClientConnection::new(identity(user), tx));
        let _ = ctx.registry.register(Arc::clone(&conn)).await;
        conn.release();
        (conn, rx)
    }

    fn events(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let v: Value = serde_json::from_str(&frame).unwrap();
            out.push((v["event"].as_str().unwrap().to_owned(), v["data"].clone()));
        }
        out
    }

    fn alice_note(title: &str) -> NewNotification {
        NewNotification::new(UserId::from("alice"), NotificationKind::Mention, title, "you were mentioned")
    }

    #[tokio::test]
    async fn notify_reaches_every_device_of_owner() {
        let (ctx, _store) = setup().await;
        let (_a1, mut r1) = online(&ctx, "alice").await;
        let (_a2, mut r2) = online(&ctx, "alice").await;
        let (_b, mut rb) = online(&ctx, "bob").await;

        let stored = notify(&ctx, alice_note("Ping")).await.unwrap();
        for rx in [&mut r1, &mut r2] {
            let got = events(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].0, "notification:new");
            assert_eq!(got[0].1["id"], stored.id.as_str());
            assert_eq!(got[0].1["type"], "mention");
        }
        assert!(events(&mut rb).is_empty());
    }

    #[tokio::test]
    async fn notify_rejects_oversized_title() {
        let (ctx, store) = setup().await;
        let err = notify(&ctx, alice_note(&"x".repeat(201))).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert_eq!(store.unread_count(&UserId::from("alice")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unread_lists_newest_first_with_count() {
        let (ctx, _store) = setup().await;
        let (a, _ra) = online(&ctx, "alice").await;
        let first = notify(&ctx, alice_note("One")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = notify(&ctx, alice_note("Two")).await.unwrap();

        let ack = unread(&ctx, &a).await.unwrap();
        assert_eq!(ack["count"], 2);
        assert_eq!(ack["notifications"][0]["id"], second.id.as_str());
        assert_eq!(ack["notifications"][1]["id"], first.id.as_str());
    }

    #[tokio::test]
    async fn read_confirms_to_every_device_and_hides_foreign_ids() {
        let (ctx, store) = setup().await;
        let (a1, mut r1) = online(&ctx, "alice").await;
        let (_a2, mut r2) = online(&ctx, "alice").await;
        let (b, _rb) = online(&ctx, "bob").await;
        let stored = notify(&ctx, alice_note("Ping")).await.unwrap();
        let _ = (events(&mut r1), events(&mut r2));

        let target = || NotificationRef { notification_id: stored.id.clone() };
        assert_matches!(read(&ctx, &b, target()).await, Err(EventError::NotFound(_)));
        assert_eq!(store.notification(&stored.id).unwrap().status, NotificationStatus::Unread);

        assert!(read(&ctx, &a1, target()).await.is_ok());
        assert_eq!(store.notification(&stored.id).unwrap().status, NotificationStatus::Read);
        for rx in [&mut r1, &mut r2] {
            let got = events(rx);
            assert_eq!(got[0].0, "notification:read-confirmed");
            assert_eq!(got[0].1["notificationId"], stored.id.as_str());
        }
    }

    #[tokio::test]
    async fn mark_all_read_reports_count() {
        let (ctx, _store) = setup().await;
        let (a, mut ra) = online(&ctx, "alice").await;
        for title in ["One", "Two", "Three"] {
            let _ = notify(&ctx, alice_note(title)).await.unwrap();
        }
        let _ = events(&mut ra);

        assert_eq!(read_all(&ctx, &a).await.unwrap()["count"], 3);
        let got = events(&mut ra);
        assert_eq!(got[0].0, "notifications:all-read-confirmed");
        assert_eq!(got[0].1["count"], 3);
        assert_eq!(read_all(&ctx, &a).await.unwrap()["count"], 0);
    }

    #[tokio::test]
    async fn delete_confirms_and_second_delete_is_not_found() {
        let (ctx, store) = setup().await;
        let (a, mut ra) = online(&ctx, "alice").await;
        let stored = notify(&ctx, alice_note("Ping")).await.unwrap();
        let _ = events(&mut ra);

        let target = || NotificationRef { notification_id: stored.id.clone() };
        assert!(delete(&ctx, &a, target()).await.is_ok());
        assert_eq!(events(&mut ra)[0].0, "notification:deleted-confirmed");
        assert!(store.notification(&stored.id).is_none());
        assert_matches!(delete(&ctx, &a, target()).await, Err(EventError::NotFound(_)));
        assert_matches!(
            read(&ctx, &a, NotificationRef { notification_id: NotificationId::from("ghost") }).await,
            Err(EventError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn subscriptions_gate_type_broadcasts() {
        let (ctx, _store) = setup().await;
        let (a, mut ra) = online(&ctx, "alice").await;
        let (_b, mut rb) = online(&ctx, "bob").await;

        let types = NotificationTypesParams { types: vec![NotificationKind::System, NotificationKind::GroupAdd] };
        let ack = subscribe(&ctx, &a, &types);
        assert_eq!(ack["subscribedTo"], json!(["system", "group_add"]));

        assert_eq!(announce(&ctx, NotificationKind::System, &json!({ "text": "maintenance" })), 1);
        let got = events(&mut ra);
        assert_eq!(got[0].0, "notification:broadcast");
        assert_eq!(got[0].1["type"], "system");
        assert_eq!(got[0].1["data"]["text"], "maintenance");
        assert!(events(&mut rb).is_empty());

        let only_system = NotificationTypesParams { types: vec![NotificationKind::System] };
        let ack = unsubscribe(&ctx, &a, &only_system);
        assert_eq!(ack["unsubscribedFrom"], json!(["system"]));
        assert_eq!(announce(&ctx, NotificationKind::System, &json!({})), 0);
        assert_eq!(announce(&ctx, NotificationKind::GroupAdd, &json!({})), 1);
    }
}

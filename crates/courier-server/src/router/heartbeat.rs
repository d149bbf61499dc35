//! Heartbeat and latency metrics.

use chrono::Utc;
use serde_json::{Value, json};

use crate::connection::ClientConnection;
use crate::context::DeliveryContext;
use crate::protocol::HeartbeatParams;

/// Record a heartbeat. Latency is server time minus the client's timestamp,
/// zero when the client sent none.
pub(super) fn heartbeat(ctx: &DeliveryContext, conn: &ClientConnection, params: &HeartbeatParams) -> Value {
    let now = Utc::now().timestamp_millis();
    let latency = params.timestamp.map_or(0, |sent| (now - sent).max(0));
    conn.mark_alive();
    let metrics = ctx.heartbeats.record_heartbeat(&conn.id, conn.user_id(), latency);
    json!({
        "serverTimestamp": now,
        "latency": latency,
        "metrics": metrics,
    })
}

pub(super) fn get_metrics(ctx: &DeliveryContext, conn: &ClientConnection) -> Value {
    json!({
        "metrics": ctx.heartbeats.get_metrics(conn.user_id()),
        "global": ctx.heartbeats.global_stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::connection::tests::identity;
    use crate::context::tests::make_context;
    use courier_store::MemoryStore;
    use tokio::sync::mpsc;

    fn conn(user: &str) -> ClientConnection {
        let (tx, _rx) = mpsc::channel(1);
        ClientConnection::new(identity(user), tx)
    }

    #[tokio::test]
    async fn latency_from_client_timestamp() {
        let ctx = make_context(Arc::new(MemoryStore::new()));
        let c = conn("alice");
        let sent = Utc::now().timestamp_millis() - 40;
        let ack = heartbeat(&ctx, &c, &HeartbeatParams { timestamp: Some(sent) });
        assert!(ack["latency"].as_i64().unwrap() >= 40);
        assert_eq!(ack["metrics"]["totalHeartbeats"], 1);
        assert!(ack["serverTimestamp"].as_i64().unwrap() >= sent);
    }

    #[tokio::test]
    async fn future_or_missing_timestamps_count_as_zero() {
        let ctx = make_context(Arc::new(MemoryStore::new()));
        let c = conn("alice");
        let future = Utc::now().timestamp_millis() + 60_000;
        let ack = heartbeat(&ctx, &c, &HeartbeatParams { timestamp: Some(future) });
        assert_eq!(ack["latency"], 0);
        let ack = heartbeat(&ctx, &c, &HeartbeatParams { timestamp: None });
        assert_eq!(ack["latency"], 0);
        assert_eq!(ack["metrics"]["totalHeartbeats"], 2);
    }

    #[tokio::test]
    async fn metrics_are_per_identity() {
        let ctx = make_context(Arc::new(MemoryStore::new()));
        let alice = conn("alice");
        let bob = conn("bob");
        let _ = heartbeat(&ctx, &alice, &HeartbeatParams { timestamp: None });

        assert_eq!(get_metrics(&ctx, &alice)["metrics"]["totalHeartbeats"], 1);
        assert!(get_metrics(&ctx, &bob)["metrics"].is_null());
        assert!(get_metrics(&ctx, &bob)["global"].is_object());
    }
}

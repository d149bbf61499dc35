//! WebSocket session lifecycle: one authenticated client from upgrade
//! through disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use courier_core::Identity;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::router::DeliveryRouter;

/// Run a WebSocket session for an authenticated client.
///
/// 1. Registers the connection and runs the connect sequence (presence
///    transition, queue flush) before reading any frame
/// 2. Forwards outbound frames and sends periodic Ping frames, closing
///    unresponsive clients
/// 3. Dispatches inbound text (or UTF-8 binary) frames in arrival order,
///    awaiting each handler before reading the next
/// 4. Runs the disconnect sequence when the client leaves, the connection
///    is closed server-side, or the server shuts down
#[instrument(skip_all, fields(user_id = %identity.id))]
pub async fn run_session(
    ws: WebSocket,
    identity: Identity,
    router: DeliveryRouter,
    shutdown: CancellationToken,
) {
    let config = Arc::clone(&router.context().config);
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.send_queue_capacity);
    let conn = Arc::new(ClientConnection::new(identity, send_tx));
    let conn_id = conn.id.clone();

    info!(%conn_id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    // Outbound forwarder with periodic Ping frames.
    let outbound_conn = Arc::clone(&conn);
    let ping_every = config.ping_interval;
    let pong_timeout = config.pong_timeout;
    let outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_pong_elapsed() > pong_timeout
                    {
                        warn!(conn_id = %outbound_conn.id, "client unresponsive for {pong_timeout:?}, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_conn.closed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        outbound_conn.close();
    });

    let _ = router.on_connect(&conn).await;

    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => {
                debug!(%conn_id, "server shutting down, closing session");
                break;
            }
            () = conn.closed() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(%conn_id, error = %e, "websocket read failed");
                    break;
                }
                None => break,
            },
        };
        conn.mark_alive();

        // Extract text from either Text or Binary frames
        let text = match msg {
            Message::Text(ref t) => Some(t.to_string()),
            Message::Binary(ref data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    Some(s.to_owned())
                } else {
                    info!(%conn_id, len = data.len(), "received non-UTF8 binary frame");
                    None
                }
            }
            Message::Close(_) => {
                info!(%conn_id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => None,
        };
        let Some(text) = text else { continue };

        if let Some(ack) = router.handle_frame(&conn, &text).await {
            if !conn.send(Arc::new(ack)) {
                info!(%conn_id, "failed to enqueue ack (channel full or closed)");
            }
        }
    }

    // Clean up
    conn.close();
    router.on_disconnect(&conn).await;
    info!(%conn_id, age_ms = conn.age().as_millis() as u64, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    let _ = outbound.await;
}

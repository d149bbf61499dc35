//! Cross-process fan-out.
//!
//! Every room emit is published as a [`ClusterEnvelope`] on a shared bus;
//! each process delivers envelopes from other nodes to its own sockets.
//! The bus is Redis pub/sub in production and an in-process broadcast
//! channel in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::ConnectionId;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::CLUSTER_PUBLISH_DROPPED_TOTAL;
use crate::registry::ConnectionRegistry;

/// Outbound envelopes buffered between emitters and the publisher task.
const PUBLISH_QUEUE_CAPACITY: usize = 4096;

/// Pause before resubscribing after the subscription failed or ended.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// A room emit as it travels between processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEnvelope {
    /// Node that emitted it; receivers skip their own envelopes.
    pub origin: String,
    /// Target room.
    pub room: String,
    /// Connection excluded from delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<ConnectionId>,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub data: Value,
}

/// Cluster bus failures.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Redis command or connection failure.
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    /// Envelope could not be encoded.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Publish/subscribe transport shared by every node.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Publish one envelope to every subscriber.
    async fn publish(&self, envelope: &ClusterEnvelope) -> Result<(), ClusterError>;

    /// Open a subscription. The stream ends when the subscription is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, ClusterEnvelope>, ClusterError>;
}

// ── Redis ──────────────────────────────────────────────────────────────

/// Redis pub/sub on a single channel.
pub struct RedisClusterBus {
    client: ::redis::Client,
    publisher: ::redis::aio::ConnectionManager,
    channel: String,
}

impl RedisClusterBus {
    /// Bus over `channel`. `client` opens the dedicated subscriber
    /// connection; `publisher` is the shared multiplexed connection.
    pub fn new(
        client: ::redis::Client,
        publisher: ::redis::aio::ConnectionManager,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            client,
            publisher,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ClusterBus for RedisClusterBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, envelope: &ClusterEnvelope) -> Result<(), ClusterError> {
        use ::redis::AsyncCommands;

        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(&self.channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, ClusterEnvelope>, ClusterError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(error) => {
                    warn!(%error, "unreadable cluster payload");
                    return None;
                }
            };
            match serde_json::from_str(&payload) {
                Ok(envelope) => Some(envelope),
                Err(error) => {
                    warn!(%error, "malformed cluster envelope");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ── In-process ─────────────────────────────────────────────────────────

/// Broadcast-channel bus connecting servers inside one process.
#[derive(Clone, Debug)]
pub struct MemoryBus {
    tx: broadcast::Sender<ClusterEnvelope>,
}

impl MemoryBus {
    /// Bus buffering up to `capacity` envelopes per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ClusterBus for MemoryBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: &ClusterEnvelope) -> Result<(), ClusterError> {
        // No subscribers is not an error.
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, ClusterEnvelope>, ClusterError> {
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "cluster subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ── Publisher handle and tasks ─────────────────────────────────────────

/// Non-blocking handle emitters use to hand envelopes to the publisher task.
#[derive(Clone, Debug)]
pub struct ClusterPublisher {
    node_id: Arc<str>,
    tx: mpsc::Sender<ClusterEnvelope>,
}

impl ClusterPublisher {
    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Queue a room emit for other nodes. Drops (and counts) when the
    /// publisher falls behind.
    pub fn publish(&self, room: &str, except: Option<&ConnectionId>, event: &str, data: &Value) {
        let envelope = ClusterEnvelope {
            origin: self.node_id.to_string(),
            room: room.to_owned(),
            except: except.cloned(),
            event: event.to_owned(),
            data: data.clone(),
        };
        if self.tx.try_send(envelope).is_err() {
            counter!(CLUSTER_PUBLISH_DROPPED_TOTAL).increment(1);
            warn!(room, event, "cluster publish queue full, dropping envelope");
        }
    }
}

/// Attach `registry` to `bus` and start the publisher and listener tasks.
///
/// The first subscription is opened before returning so emits that follow
/// immediately are already observed by this node.
pub async fn start(
    bus: Arc<dyn ClusterBus>,
    registry: Arc<ConnectionRegistry>,
    node_id: &str,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
    let publisher = ClusterPublisher {
        node_id: Arc::from(node_id),
        tx,
    };
    if !registry.attach_cluster(publisher) {
        warn!("cluster publisher already attached");
    }

    let initial = match bus.subscribe().await {
        Ok(stream) => Some(stream),
        Err(error) => {
            warn!(%error, bus = bus.name(), "cluster subscribe failed, will retry");
            None
        }
    };
    info!(bus = bus.name(), node_id, "cluster fan-out enabled");

    let publisher_task = tokio::spawn(run_publisher(Arc::clone(&bus), rx, token.clone()));
    let listener_task = tokio::spawn(run_listener(
        bus,
        registry,
        node_id.to_owned(),
        initial,
        token,
    ));
    vec![publisher_task, listener_task]
}

async fn run_publisher(
    bus: Arc<dyn ClusterBus>,
    mut rx: mpsc::Receiver<ClusterEnvelope>,
    token: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if let Err(error) = bus.publish(&envelope).await {
            warn!(%error, room = %envelope.room, event = %envelope.event, "cluster publish failed");
        }
    }
    debug!("cluster publisher stopped");
}

async fn run_listener(
    bus: Arc<dyn ClusterBus>,
    registry: Arc<ConnectionRegistry>,
    node_id: String,
    mut initial: Option<BoxStream<'static, ClusterEnvelope>>,
    token: CancellationToken,
) {
    loop {
        let subscription = match initial.take() {
            Some(stream) => Ok(stream),
            None => bus.subscribe().await,
        };
        match subscription {
            Ok(mut stream) => loop {
                let envelope = tokio::select! {
                    () = token.cancelled() => return,
                    next = stream.next() => next,
                };
                match envelope {
                    Some(envelope) if envelope.origin == node_id => {}
                    Some(envelope) => {
                        let delivered = registry.deliver_remote(&envelope);
                        debug!(room = %envelope.room, event = %envelope.event, delivered, "cluster envelope delivered");
                    }
                    None => {
                        warn!(bus = bus.name(), "cluster subscription ended");
                        break;
                    }
                }
            },
            Err(error) => warn!(%error, bus = bus.name(), "cluster subscribe failed"),
        }
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}

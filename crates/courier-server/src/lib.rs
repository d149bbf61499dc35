//! # courier-server
//!
//! Axum HTTP + `WebSocket` gateway for multi-device message delivery.
//!
//! - Handshake authentication (bearer header, query or cookie JWT)
//! - Connection registry with per-user and per-conversation rooms
//! - Event router: send, read receipts, typing, missed-message sync, edit
//!   locks, heartbeats, each behind a per-event rate limit
//! - Offline queue flush on the first connection of an identity
//! - Optional cross-node fan-out over a [`cluster::ClusterBus`]
//! - `/health` and Prometheus `/metrics`, periodic expiry sweep, graceful
//!   shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod health;
pub mod limits;
pub mod maintenance;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod typing;

pub use cluster::{ClusterBus, ClusterEnvelope, MemoryBus, RedisClusterBus};
pub use config::ServerConfig;
pub use errors::{AuthError, EventError};
pub use router::DeliveryRouter;
pub use server::{CourierServer, ServerDeps};

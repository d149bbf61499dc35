//! `CourierServer`: Axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use courier_core::Stores;
use courier_state::{OfflineQueue, PresenceStore};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::cluster::{self, ClusterBus};
use crate::config::ServerConfig;
use crate::context::DeliveryContext;
use crate::errors::AuthError;
use crate::health::{self, HealthResponse, HealthSnapshot};
use crate::maintenance;
use crate::metrics::WS_AUTH_FAILURES_TOTAL;
use crate::router::DeliveryRouter;
use crate::session::run_session;
use crate::shutdown::ShutdownCoordinator;

/// Collaborators and backing stores a server is built over.
pub struct ServerDeps {
    /// Message, conversation and user stores.
    pub stores: Stores,
    /// Identity → connections strategy.
    pub presence: Arc<dyn PresenceStore>,
    /// Offline queue strategy.
    pub queue: Arc<dyn OfflineQueue>,
    /// Cross-node fan-out; `None` for a single node.
    pub cluster: Option<Arc<dyn ClusterBus>>,
    /// Installed Prometheus recorder backing `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Event router (and through it the delivery context).
    pub router: DeliveryRouter,
    /// Handshake verifier.
    pub auth: Arc<Authenticator>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The Courier server.
pub struct CourierServer {
    config: Arc<ServerConfig>,
    router: DeliveryRouter,
    auth: Arc<Authenticator>,
    cluster: Option<Arc<dyn ClusterBus>>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl CourierServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, deps: ServerDeps) -> Self {
        let config = Arc::new(config);
        let ctx = Arc::new(DeliveryContext::new(
            Arc::clone(&config),
            deps.stores,
            deps.presence,
            deps.queue,
        ));
        Self {
            auth: Arc::new(Authenticator::new(&config.jwt_secret)),
            router: DeliveryRouter::new(ctx),
            cluster: deps.cluster,
            metrics: deps.metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            config,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            router: self.router.clone(),
            auth: Arc::clone(&self.auth),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind, start the sweeper and cluster tasks, and serve until shutdown.
    ///
    /// Returns the bound address and a handle that resolves once the
    /// listener has stopped and background tasks have drained.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let token = self.shutdown.token();
        let ctx = self.context();

        let mut background = vec![maintenance::spawn_sweeper(Arc::clone(ctx), token.clone())];
        if let Some(bus) = &self.cluster {
            background.extend(
                cluster::start(
                    Arc::clone(bus),
                    Arc::clone(&ctx.registry),
                    &self.config.node_id,
                    token.clone(),
                )
                .await,
            );
        }

        let app = self.router();
        let shutdown = Arc::clone(&self.shutdown);
        let drain = self.config.shutdown_timeout;
        let handle = tokio::spawn(async move {
            let signal = token.clone();
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
            {
                error!(%error, "server stopped with error");
            }
            shutdown.graceful_shutdown(background, Some(drain)).await;
            info!("server stopped");
        });

        info!(%addr, node_id = %self.config.node_id, clustered = self.cluster.is_some(), "courier listening");
        Ok((addr, handle))
    }

    /// Shared delivery context.
    pub fn context(&self) -> &Arc<DeliveryContext> {
        self.router.context()
    }

    /// Event router, for server-side pushes such as [`DeliveryRouter::notify`].
    pub fn delivery(&self) -> &DeliveryRouter {
        &self.router
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl std::fmt::Debug for CourierServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierServer")
            .field("node_id", &self.config.node_id)
            .field("clustered", &self.cluster.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// GET /ws: authenticate, then upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let ctx = state.router.context();
    let user = match state
        .auth
        .authenticate(
            &headers,
            query.token.as_deref(),
            ctx.stores.users.as_ref(),
            ctx.config.store_timeout,
        )
        .await
    {
        Ok(user) => user,
        Err(e) => {
            let reason = match &e {
                AuthError::NoToken => "no_token",
                AuthError::InvalidToken => "invalid_token",
                AuthError::UserNotFound => "user_not_found",
                AuthError::Unavailable(_) => "unavailable",
            };
            counter!(WS_AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
            warn!(reason, error = %e, "handshake rejected");
            return e.into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let identity = user.identity();
    let router = state.router.clone();
    let token = state.shutdown.token();
    upgrade
        .max_message_size(ctx.config.max_message_size)
        .on_upgrade(move |socket| run_session(socket, identity, router, token))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ctx = state.router.context();
    let registry = &ctx.registry;
    let snapshot = HealthSnapshot {
        connections: registry.connection_count(),
        online_identities: registry.online_identities().await.len(),
        node_id: ctx.config.node_id.clone(),
        presence_backend: registry.presence_backend(),
        degraded: registry.presence_degraded(),
        latency: ctx.heartbeats.global_stats(),
    };
    Json(health::health_check(state.start_time, snapshot))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

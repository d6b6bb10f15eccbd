//! `WardenServer`: axum HTTP + WebSocket front end and its lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use warden_core::ids::ConnectionId;
use warden_core::{QueryEngine, ToolServerSource};
use warden_telemetry::{MetricsRecorder, MetricsSnapshot};

use crate::connection::{run_connection, ConnectionContext, CONNECTIONS_GAUGE};
use crate::orchestrator::QueryOrchestrator;
use crate::reaper::IdleReaper;
use crate::registry::SessionRegistry;
use crate::shutdown::{ShutdownCoordinator, DEFAULT_SHUTDOWN_TIMEOUT};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_message_size: usize,
    pub max_send_queue: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 31337,
            idle_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
            max_message_size: 16 * 1024 * 1024,
            max_send_queue: 256,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Health check response body.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server runs.
    pub status: String,
    pub uptime_secs: u64,
    pub connections: usize,
    pub active_sessions: usize,
}

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub metrics: Arc<MetricsRecorder>,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
    pub max_message_size: usize,
    pub max_send_queue: usize,
}

impl AppState {
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".into(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            connections: self.metrics.gauge_get(CONNECTIONS_GAUGE, &[]).max(0.0) as usize,
            active_sessions: self.orchestrator.registry().len(),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let ctx = ConnectionContext {
                orchestrator: Arc::clone(&state.orchestrator),
                metrics: Arc::clone(&state.metrics),
                shutdown: state.shutdown.clone(),
                max_send_queue: state.max_send_queue,
            };
            run_connection(socket, ConnectionId::new(), ctx).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.health())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Owns the session registry and everything built around it.
pub struct WardenServer {
    config: ServerConfig,
    orchestrator: Arc<QueryOrchestrator>,
    metrics: Arc<MetricsRecorder>,
}

impl WardenServer {
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn QueryEngine>,
        tool_servers: Arc<dyn ToolServerSource>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let orchestrator = Arc::new(QueryOrchestrator::new(
            Arc::new(SessionRegistry::new()),
            engine,
            tool_servers,
            Arc::clone(&metrics),
        ));
        Self {
            config,
            orchestrator,
            metrics,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<QueryOrchestrator> {
        &self.orchestrator
    }

    /// Bind, then serve and sweep in the background.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let coordinator = ShutdownCoordinator::new();
        let state = AppState {
            orchestrator: Arc::clone(&self.orchestrator),
            metrics: Arc::clone(&self.metrics),
            shutdown: coordinator.token(),
            start_time: Instant::now(),
            max_message_size: self.config.max_message_size,
            max_send_queue: self.config.max_send_queue,
        };
        let router = build_router(state.clone());

        let token = coordinator.token();
        coordinator.track(
            "http",
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                {
                    error!(error = %e, "server error");
                }
            }),
        );

        let reaper = IdleReaper::new(
            Arc::clone(&self.orchestrator),
            self.config.idle_timeout,
            self.config.sweep_interval,
        );
        coordinator.track("reaper", reaper.spawn(coordinator.token()));

        info!(
            addr = %local_addr,
            engine = self.orchestrator.engine_name(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "warden listening"
        );

        Ok(ServerHandle {
            local_addr,
            coordinator,
            state,
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}

/// Running server. Dropping it leaves the tasks running; call [`stop`](Self::stop).
pub struct ServerHandle {
    local_addr: SocketAddr,
    coordinator: ShutdownCoordinator,
    state: AppState,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn health(&self) -> HealthResponse {
        self.state.health()
    }

    pub fn orchestrator(&self) -> &Arc<QueryOrchestrator> {
        &self.state.orchestrator
    }

    /// Cancel all loops, wait for the listener and reaper, then release every
    /// remaining session. Returns the number of sessions released.
    pub async fn stop(self) -> usize {
        info!("shutting down");
        self.coordinator.graceful_shutdown(self.shutdown_timeout).await;
        let released = self.state.orchestrator.shutdown().await;
        info!(released, "shutdown complete");
        released
    }
}

//! HTTP gateway.
//!
//! Serves:
//! - `POST /agent/ask`, `POST /agent/context`, `GET /agent/history/:sessionId`
//! - `GET /agent/logs/stream/:sessionId` (SSE) and `GET /agent/status`
//! - `POST /preview/start`, `POST /preview/stop`, `GET /preview/status`
//! - `/frontend/*` static files when a frontend directory is configured
//! - everything else: reverse proxy to the dev server

pub mod handlers;
mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::agent::Orchestrator;
use crate::config::Config;
use crate::logs::LogHub;
use crate::preview::PreviewSupervisor;
use crate::proxy::{self, DevServerProxy};

// ---------------------------------------------------------------------------
// Shared state injected into axum handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub preview: Arc<PreviewSupervisor>,
    pub proxy: Arc<DevServerProxy>,
    /// Cancelled when the gateway shuts down; ends open SSE streams.
    pub shutdown: CancellationToken,
}

impl FromRef<AppState> for Arc<DevServerProxy> {
    fn from_ref(state: &AppState) -> Self {
        state.proxy.clone()
    }
}

impl AppState {
    /// Production wiring from configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let hub = LogHub::new(&config.logs)?;
        let orchestrator = Orchestrator::from_config(&config, hub)?;
        Self::with_orchestrator(config, orchestrator)
    }

    /// Wire around an existing orchestrator (lets tests inject a mock agent).
    pub fn with_orchestrator(config: Config, orchestrator: Orchestrator) -> anyhow::Result<Self> {
        let preview = PreviewSupervisor::new(config.preview.clone(), config.workspace_root.clone());
        let proxy = DevServerProxy::new(
            &config.preview.host,
            config.preview.port,
            config.reserved_prefixes.clone(),
        )?;
        Ok(Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            preview: Arc::new(preview),
            proxy: Arc::new(proxy),
            shutdown: CancellationToken::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Gateway handle
// ---------------------------------------------------------------------------

/// Handle returned by [`start_gateway`].
pub struct Gateway {
    /// Server task handle.
    pub handle: JoinHandle<()>,
    /// The address the server is actually listening on.
    pub addr: SocketAddr,
    pub state: AppState,
}

impl Gateway {
    /// Stop accepting connections, end SSE streams, wait for the server
    /// task and stop the dev server.
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!("gateway task failed: {e}");
        }
        self.state.preview.shutdown().await;
        info!("gateway stopped");
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let agent_router = Router::new()
        .route("/ask", post(handlers::agent::ask))
        .route("/context", post(handlers::agent::context))
        .route("/history/:session_id", get(handlers::agent::history))
        .route("/logs/stream/:session_id", get(sse::log_stream))
        .route("/status", get(handlers::health::status));

    let preview_router = Router::new()
        .route("/start", post(handlers::preview::start))
        .route("/stop", post(handlers::preview::stop))
        .route("/status", get(handlers::preview::status));

    let mut app = Router::new()
        .nest("/agent", agent_router)
        .nest("/preview", preview_router);

    if let Some(dir) = &state.config.frontend_dir {
        info!(dir = %dir.display(), "serving frontend at /frontend");
        app = app.nest_service("/frontend", ServeDir::new(dir));
    }

    app.fallback(proxy::proxy_fallback)
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server startup
// ---------------------------------------------------------------------------

/// Bind `addr` and serve the gateway until [`Gateway::shutdown`].
pub async fn start_gateway(state: AppState, addr: SocketAddr) -> std::io::Result<Gateway> {
    let _ = handlers::health::STARTUP_TIME.set(std::time::Instant::now());

    if let Err(e) = state.orchestrator.workspace().ensure_root().await {
        error!("{e:#}");
    }

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let token = state.shutdown.clone();
    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await });
        if let Err(e) = serve.await {
            error!("gateway server error: {e}");
        }
    });

    info!(%bound_addr, workspace = %state.config.workspace_root.display(), "gateway started");

    Ok(Gateway {
        handle,
        addr: bound_addr,
        state,
    })
}

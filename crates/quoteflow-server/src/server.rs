use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use quoteflow_core::{Broadcaster, RefreshScheduler, TieredCache};
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{handlers, ws};

/// Shared handles for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<TieredCache>,
    pub scheduler: Arc<RefreshScheduler>,
    pub broadcaster: Arc<Broadcaster>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Subscriber transport
        .route("/ws", get(ws::ws_handler))
        // Operator surface
        .route("/admin/jobs", get(handlers::list_jobs))
        .route("/admin/jobs/{name}/refresh", post(handlers::refresh_job))
        .route("/admin/jobs/{name}/data", get(handlers::job_data))
        .route("/admin/cache/stats", get(handlers::cache_stats))
        .route("/admin/broadcaster/stats", get(handlers::broadcaster_stats))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(
            |req: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http.request",
                    http.method = %req.method(),
                    http.target = %req.uri(),
                )
            },
        ))
        .with_state(state)
}

pub struct QuoteflowServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    background: Vec<watch::Sender<bool>>,
}

impl QuoteflowServer {
    pub fn new(addr: SocketAddr, state: AppState, background: Vec<watch::Sender<bool>>) -> Self {
        Self {
            addr,
            app: build_app(state.clone()),
            state,
            background,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until Ctrl+C, then stop background loops and close every
    /// subscriber connection.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let broadcaster = self.state.broadcaster.clone();
        let background = self.background;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                for handle in &background {
                    let _ = handle.send(true);
                }
                let closed = broadcaster.shutdown();
                tracing::info!(connections = closed, "subscriber connections closed");
            })
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

//! The tandem rendezvous server: assigns peer ids, introduces peers to each
//! other with fixed polite/impolite roles, relays their opaque negotiation
//! payloads and announces departures.

pub mod config;
pub mod registry;
pub mod telemetry;
mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{extract::State, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use config::{Cli, ServerConfig};
pub use registry::{ConnectionId, PeerRegistry, RegistryError};

pub struct AppState {
    pub registry: PeerRegistry,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle) -> Arc<Self> {
        Arc::new(Self {
            registry: PeerRegistry::new(),
            metrics,
        })
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

/// Signaling at `/ws`, liveness at `/healthz`, Prometheus text at
/// `/metrics`, and optionally a static directory for everything else.
pub fn router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler));
    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serves `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "peers": state.registry.peer_count() }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

//! Live status server
//!
//! Optional HTTP surface for watching a run in progress:
//! - `GET /health` liveness
//! - `GET /status` latest [`LiveStatus`] as JSON
//! - `GET /metrics/prometheus` Prometheus exposition

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::runner::LiveStatus;

/// Shared state for the status routes
#[derive(Clone)]
pub struct StatusState {
    status: watch::Receiver<LiveStatus>,
    prometheus: Option<PrometheusHandle>,
    started: Instant,
}

impl StatusState {
    pub fn new(status: watch::Receiver<LiveStatus>) -> Self {
        Self {
            status,
            prometheus: None,
            started: Instant::now(),
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

async fn health(State(state): State<StatusState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn status(State(state): State<StatusState>) -> Json<LiveStatus> {
    Json(state.status.borrow().clone())
}

async fn prometheus_metrics(State(state): State<StatusState>) -> Response {
    match state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "Prometheus exporter not installed").into_response(),
    }
}

/// Build the status router
pub fn status_routes(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the status routes until the process exits
pub async fn serve(addr: SocketAddr, state: StatusState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server listening on {}", listener.local_addr()?);
    axum::serve(listener, status_routes(state)).await
}

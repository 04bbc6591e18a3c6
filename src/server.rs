//! Health and metrics server
//!
//! Small HTTP surface for health checks and scraping:
//! - `GET /healthz` liveness
//! - `GET /readyz` ready once the StorageClass cache is synced
//! - `GET /metrics` Prometheus text exposition
//! - `GET /operations` keys of the operations currently running

use crate::controller::scheduler::{OperationScheduler, RunningOperation};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Default bind address
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Shared handler state
#[derive(Clone)]
pub struct ServerState {
    pub metrics: Metrics,
    pub scheduler: OperationScheduler,
    pub ready: watch::Receiver<bool>,
}

/// Running operations response
#[derive(Debug, Serialize)]
pub struct OperationsResponse {
    pub count: usize,
    pub running: Vec<RunningOperation>,
}

/// Build the router
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics))
        .route("/operations", get(operations))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn run(addr: SocketAddr, state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind HTTP server on {}: {}", addr, e)))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("HTTP server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness_check(State(state): State<ServerState>) -> impl IntoResponse {
    if *state.ready.borrow() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!("failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn operations(State(state): State<ServerState>) -> Json<OperationsResponse> {
    let running = state.scheduler.snapshot();
    Json(OperationsResponse {
        count: running.len(),
        running,
    })
}

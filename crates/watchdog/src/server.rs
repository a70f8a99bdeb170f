//! HTTP status surface.
//!
//! Read-only endpoints over the pipeline:
//! - `GET /status` - process directory (rate limited)
//! - `GET /health` - supervisor reachability, 200 or 503 (rate limited)
//! - `GET /metrics` - counters and gauges
//! - `GET /queue` - alerts waiting for retry
//! - `GET /dead-letters` - alerts that exhausted their retries

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RateLimitConfig;
use crate::pipeline::AlertPipeline;
use crate::rate_limit::RateLimiter;
use crate::supervisor::ProcessRecord;

/// State shared across handlers.
pub struct ServerState {
    pub pipeline: Arc<AlertPipeline>,
    pub status_limiter: Arc<RateLimiter>,
    pub health_limiter: Arc<RateLimiter>,
    pub limits: RateLimitConfig,
}

impl ServerState {
    #[must_use]
    pub fn new(pipeline: Arc<AlertPipeline>, limits: RateLimitConfig) -> Self {
        Self {
            pipeline,
            status_limiter: Arc::new(RateLimiter::new(limits.window)),
            health_limiter: Arc::new(RateLimiter::new(limits.window)),
            limits,
        }
    }

    /// Start the sweeper of each limiter.
    pub fn spawn_sweepers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let interval = self.limits.sweep_interval;
        vec![
            Arc::clone(&self.status_limiter).spawn_sweeper(interval, shutdown.clone()),
            Arc::clone(&self.health_limiter).spawn_sweeper(interval, shutdown.clone()),
        ]
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/queue", get(queue_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn run_server(
    state: Arc<ServerState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Watchdog status server listening on {addr}");
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("Status server failed")?;
    Ok(())
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

/// `429` with a `Retry-After` header.
struct TooManyRequests(u64);

impl IntoResponse for TooManyRequests {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, self.0.to_string())],
            Json(ErrorBody {
                error: "Too many requests".to_string(),
                retry_after_secs: Some(self.0),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    processes: Vec<ProcessRecord>,
}

fn limit(limiter: &RateLimiter, addr: SocketAddr, max: u32) -> Result<(), TooManyRequests> {
    let decision = limiter.check_limit(&addr.ip().to_string(), max);
    if decision.allowed {
        Ok(())
    } else {
        Err(TooManyRequests(decision.retry_after_secs.unwrap_or(1)))
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn status_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if let Err(rejection) = limit(&state.status_limiter, addr, state.limits.status_max_requests) {
        return rejection.into_response();
    }

    match state.pipeline.status().await {
        Ok(processes) => Json(StatusResponse {
            processes: processes.as_ref().clone(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: e.to_string(),
                retry_after_secs: None,
            }),
        )
            .into_response(),
    }
}

async fn health_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if let Err(rejection) = limit(&state.health_limiter, addr, state.limits.health_max_requests) {
        return rejection.into_response();
    }

    let report = state.pipeline.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.pipeline.metrics())
}

async fn queue_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.pipeline.retry_queue().pending())
}

async fn dead_letters_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.pipeline.retry_queue().dead_letter_entries())
}

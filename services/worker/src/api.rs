use crate::config::ApiConfig;
use crate::limiter::{ConcurrencyLimiter, LimiterError};
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::stream_log::{GroupStatus, StreamLog};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<WorkerMetrics>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub log: Arc<dyn StreamLog>,
    pub shutdown: CancellationToken,
}

/// Consumer-group and concurrency view
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusResponse {
    pub consumer: String,
    pub shutting_down: bool,
    pub concurrency: ConcurrencyStatus,
    /// `None` when the log could not be queried
    pub group: Option<GroupStatus>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyStatus {
    pub limit: usize,
    pub in_use: usize,
    pub available: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyUpdateResponse {
    pub previous: usize,
    pub concurrency: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn bad_request(error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.into(),
            code: "INVALID_CONCURRENCY".to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_snapshot))
        .route("/worker/status", get(worker_status))
        .route("/control/concurrency", post(set_concurrency))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.shutdown.is_cancelled() {
        "draining"
    } else {
        "healthy"
    };
    Json(serde_json::json!({
        "status": status,
        "service": "analysis-worker"
    }))
}

/// Metrics snapshot endpoint
async fn metrics_snapshot(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot(state.limiter.ceiling()))
}

/// Consumer-group state endpoint
#[instrument(skip(state))]
async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatusResponse> {
    let group = match state.log.group_status().await {
        Ok(group) => Some(group),
        Err(e) => {
            warn!(error = %e, "Failed to read consumer group state");
            None
        }
    };
    let limit = state.limiter.ceiling();

    Json(WorkerStatusResponse {
        consumer: state.log.consumer_name().to_string(),
        shutting_down: state.shutdown.is_cancelled(),
        concurrency: ConcurrencyStatus {
            limit,
            in_use: state.limiter.in_use(),
            available: state.limiter.available(),
        },
        group,
        metrics: state.metrics.snapshot(limit),
    })
}

/// Change the concurrency ceiling at runtime
#[instrument(skip(state))]
async fn set_concurrency(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ConcurrencyUpdateResponse>, (StatusCode, Json<ErrorResponse>)> {
    let raw = params
        .get("n")
        .ok_or_else(|| bad_request("query parameter n is required"))?;
    let requested: i64 = raw
        .trim()
        .parse()
        .map_err(|_| bad_request(format!("n must be an integer, got {raw:?}")))?;

    let previous = state.limiter.set_ceiling(requested).map_err(|e| match e {
        LimiterError::InvalidCeiling(_) => bad_request(e.to_string()),
        LimiterError::Closed => {
            error!("Concurrency limiter closed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: "LIMITER_CLOSED".to_string(),
                }),
            )
        }
    })?;

    let concurrency = state.limiter.ceiling();
    state.metrics.record_limit(concurrency);

    Ok(Json(ConcurrencyUpdateResponse {
        previous,
        concurrency,
    }))
}

/// Start the operational API server; returns once `state.shutdown` fires
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting operational API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

//! Health and metrics endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness with version and uptime
//! - `GET /metrics` - JSON snapshot of the in-process request metrics
//!
//! The Prometheus exposition of the same data, when enabled, is served by the
//! exporter on `METRICS_PORT`, not by this router.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::metrics::MetricsSnapshot;
use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Metrics snapshot endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "total_requests": { "/health": 12 },
///   "active_requests": 1,
///   "error_counts": { "/echo_403": 2 },
///   "feature_usage": { "echo": 4 },
///   "avg_response_time_ms": { "/health": 0.21 }
/// }
/// ```
#[instrument(skip(state))]
pub async fn metrics_snapshot(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

//! Application routing configuration with middleware chains.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────────────────────────────────┐
//! │ Global chain (every route)                   │
//! │  security headers → rate limit → CORS →      │
//! │  recovery → logging → metrics                │
//! └────────┬─────────────────────────────────────┘
//!          │
//!          ▼
//! ┌──────────────────────────────────────────────┐
//! │ Secure chain (POST /echo only)               │
//! │  security headers → CSRF → route rate limit  │
//! │  → recovery → logging                        │
//! └────────┬─────────────────────────────────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /health` - Liveness
//! - `GET /csrf-token` - Issue a CSRF token
//! - `GET /metrics` - Metrics snapshot (JSON)
//! - `POST /echo` - Echo a form field (CSRF-protected, stricter rate limit)

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tracing::info;

use crate::chain;
use crate::handlers;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// # Arguments
///
/// * `state` - Application state holding the admission components
///
/// # Returns
///
/// Fully configured Axum router ready to be served.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let secure = chain::secure(&state);
    info!(middlewares = ?secure.names(), "Secure chain configured for POST /echo");
    let echo = secure.apply_to(post(handlers::echo));

    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/csrf-token", get(handlers::issue_csrf_token))
        .route("/metrics", get(handlers::metrics_snapshot))
        .route("/echo", echo)
        .layer(DefaultBodyLimit::max(config.max_form_body_size));

    let global = chain::global(&state);
    info!(middlewares = ?global.names(), "Global chain configured");

    global.apply_to(router).with_state(state)
}

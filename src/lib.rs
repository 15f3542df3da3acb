//! # Scribe Web
//!
//! Request admission and security pipeline for a self-hosted transcription
//! front end, built on Axum and Tower:
//!
//! - **CSRF**: Random, expiring, reusable tokens checked on state-changing requests
//! - **Rate Limiting**: Per-client fixed windows, several independent limiters
//! - **Hardening**: Security headers, CORS, panic recovery
//! - **Observability**: Request IDs, structured logs, request metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  MiddlewareChain presets (global / secure / public)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (CSRF, rate limit, headers, CORS, recovery,     │
//! │              request log, metrics)                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ExpiringStore (tokens, rate buckets) + sweeper tasks       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, csrf-token, metrics, echo)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scribe_web::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state.clone());
//!
//!     // Serve `app`, then:
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Chains
//!
//! ```rust,ignore
//! use scribe_web::chain::{MiddlewareChain, Middleware, Next};
//!
//! let chain = MiddlewareChain::new()
//!     .security()
//!     .rate_limit(limiter)
//!     .with(Middleware::from_fn("audit", |req, next: Next| async move {
//!         next.run(req).await
//!     }));
//! let router = chain.apply_to(router);
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use chain::{ChainConfig, Middleware, MiddlewareChain, MiddlewareRegistrar, Next};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use metrics::{Metrics, MetricsSnapshot};
pub use routes::build_router;
pub use state::{AppState, BackgroundTasks};
pub use store::ExpiringStore;

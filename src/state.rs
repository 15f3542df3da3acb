//! Shared application state and background task lifecycle.
//!
//! [`AppState`] is the composition root: every admission component (CSRF
//! guard, rate limiters, CORS policy, metrics) is constructed here once and
//! handed to the middleware chains and handlers by reference. There is no
//! package-level mutable state.
//!
//! # Thread Safety
//!
//! All components are wrapped in `Arc` or are cheap handles over shared
//! `Arc` data, so cloning the state per request is inexpensive.
//!
//! # Structured Concurrency
//!
//! Periodic sweeps of the token store and rate-limit buckets run as tasks on
//! [`BackgroundTasks`], which pairs a `tokio_util::task::TaskTracker` with a
//! `CancellationToken`. Call [`AppState::shutdown`] to stop them before exit.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::metrics::Metrics;
use crate::middleware::{CorsLayer, CsrfGuard, FixedWindowLimiter};

/// Tracked, cancellable background tasks.
///
/// Cloning yields another handle to the same set of tasks.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl BackgroundTasks {
    /// Create an empty task set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled when [`shutdown`](Self::shutdown) is called.
    ///
    /// Tasks must watch it and return promptly once it fires.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Whether no tracked task is running.
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Whether shutdown has completed or is in progress.
    pub fn is_shut_down(&self) -> bool {
        self.cancellation_token.is_cancelled() && self.tracker.is_closed()
    }

    /// Gracefully stop all tasks.
    ///
    /// 1. Signals all tasks to stop via the cancellation token
    /// 2. Closes the tracker
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Shared application state for Axum handlers and middleware presets.
///
/// # Lifecycle
///
/// Sweepers are spawned when the state is created. Call `shutdown()` before
/// dropping to ensure clean task termination:
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// CSRF token issuer/validator
    pub csrf: CsrfGuard,
    /// Limiter applied to every route
    pub global_limiter: Arc<FixedWindowLimiter>,
    /// Stricter limiter for state-changing routes
    pub route_limiter: Arc<FixedWindowLimiter>,
    /// Request and feature metrics
    pub metrics: Arc<Metrics>,
    /// CORS policy built from the configured origins
    pub cors: CorsLayer,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Sweeper tasks
    tasks: BackgroundTasks,
}

impl AppState {
    /// Build all admission components from `config` and start their sweepers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a rate limit is configured with a
    /// zero request count or window.
    pub fn new(config: Config) -> AppResult<Self> {
        let global_limiter = Arc::new(FixedWindowLimiter::new(
            config.rate_limit_max_requests,
            config.rate_limit_window,
        )?);
        let route_limiter = Arc::new(FixedWindowLimiter::new(
            config.route_rate_limit_max_requests,
            config.route_rate_limit_window,
        )?);
        let csrf = CsrfGuard::new(config.csrf_token_ttl);
        let cors = CorsLayer::new(&config.cors_allowed_origins);
        let tasks = BackgroundTasks::new();

        csrf.spawn_sweeper(config.csrf_sweep_interval, &tasks);
        global_limiter.spawn_sweeper(config.rate_limit_sweep_interval, &tasks);
        route_limiter.spawn_sweeper(config.rate_limit_sweep_interval, &tasks);

        info!(
            global_limit = config.rate_limit_max_requests,
            global_window_secs = config.rate_limit_window.as_secs(),
            route_limit = config.route_rate_limit_max_requests,
            route_window_secs = config.route_rate_limit_window.as_secs(),
            csrf_ttl_secs = config.csrf_token_ttl.as_secs(),
            "Admission components initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            csrf,
            global_limiter,
            route_limiter,
            metrics: Arc::new(Metrics::new()),
            cors,
            started_at: Instant::now(),
            tasks,
        })
    }

    /// Background task set, for components created after startup.
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Gracefully shutdown all background tasks.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");
        self.tasks.shutdown().await;
        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_new_spawns_sweepers_and_shutdown_stops_them() {
        let state = AppState::new(Config::default()).unwrap();
        assert_eq!(state.tasks().len(), 3);

        state.shutdown().await;
        assert!(state.tasks().is_empty());
        assert!(state.tasks().is_shut_down());
    }

    #[tokio::test]
    async fn test_zero_rate_limit_is_config_error() {
        let config = Config {
            route_rate_limit_max_requests: 0,
            ..Config::default()
        };

        assert!(matches!(AppState::new(config), Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_spawned_task_sees_cancellation() {
        let tasks = BackgroundTasks::new();
        let token = tasks.cancellation_token();
        tasks.spawn(async move { token.cancelled().await });

        assert!(!tasks.is_shut_down());
        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown())
            .await
            .unwrap();
        assert!(tasks.is_shut_down());
    }
}

//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Admission Control
//!
//! - `RATE_LIMIT_MAX_REQUESTS` / `RATE_LIMIT_WINDOW_SECS`: global per-client window (default: 100 per 60s)
//! - `ROUTE_RATE_LIMIT_MAX_REQUESTS` / `ROUTE_RATE_LIMIT_WINDOW_SECS`: stricter window for
//!   state-changing routes (default: 20 per 60s)
//! - `RATE_LIMIT_SWEEP_SECS`: stale bucket sweep period (default: 60)
//! - `CSRF_TOKEN_TTL_SECS`: token lifetime (default: 86400)
//! - `CSRF_SWEEP_SECS`: expired token sweep period (default: 3600)
//! - `MAX_FORM_BODY_SIZE`: largest form body buffered for CSRF inspection (default: 1MB)
//!
//! # Security Configuration
//!
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins (default: `*` for dev)
//!
//! # Observability
//!
//! - `RUST_LOG`: log filter (default: `info`)
//! - `LOG_FORMAT`: `text` or `json` (default: `text`)
//! - `METRICS_PORT`: Prometheus listener port (default: 0 = disabled)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests allowed per client per global window (default: 100)
    pub rate_limit_max_requests: u32,

    /// Length of the global fixed window (default: 60s)
    pub rate_limit_window: Duration,

    /// Requests allowed per client per window on state-changing routes (default: 20)
    pub route_rate_limit_max_requests: u32,

    /// Length of the route-level fixed window (default: 60s)
    pub route_rate_limit_window: Duration,

    /// How often stale rate-limit buckets are swept (default: 60s)
    pub rate_limit_sweep_interval: Duration,

    // =========================================================================
    // CSRF Configuration
    // =========================================================================
    /// Lifetime of an issued CSRF token (default: 24h)
    pub csrf_token_ttl: Duration,

    /// How often expired CSRF tokens are swept (default: 1h)
    pub csrf_sweep_interval: Duration,

    /// Maximum form body buffered while looking for the `csrf_token` field
    /// (default: 1MB). Larger url-encoded bodies are rejected with 413.
    pub max_form_body_size: usize,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable text
    pub log_json: bool,

    /// Port for Prometheus metrics endpoint (default: 0 = disabled)
    pub metrics_port: u16,
}

/// Upper bound for every configured window, TTL and sweep period (one year).
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is invalid
    /// (e.g., non-numeric PORT value, zero-length window).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,

            // Rate limiting
            rate_limit_max_requests: Self::parse_env("RATE_LIMIT_MAX_REQUESTS", 100)?,
            rate_limit_window: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_WINDOW_SECS",
                60,
            )?),
            route_rate_limit_max_requests: Self::parse_env("ROUTE_RATE_LIMIT_MAX_REQUESTS", 20)?,
            route_rate_limit_window: Duration::from_secs(Self::parse_env(
                "ROUTE_RATE_LIMIT_WINDOW_SECS",
                60,
            )?),
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_SECS",
                60,
            )?),

            // CSRF
            csrf_token_ttl: Duration::from_secs(Self::parse_env("CSRF_TOKEN_TTL_SECS", 86_400)?),
            csrf_sweep_interval: Duration::from_secs(Self::parse_env("CSRF_SWEEP_SECS", 3_600)?),
            max_form_body_size: Self::parse_env("MAX_FORM_BODY_SIZE", 1024 * 1024)?, // 1MB

            // Security
            cors_allowed_origins: Self::parse_cors_origins(),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            metrics_port: Self::parse_env("METRICS_PORT", 0)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.rate_limit_max_requests == 0 || self.route_rate_limit_max_requests == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_MAX_REQUESTS and ROUTE_RATE_LIMIT_MAX_REQUESTS must be greater than 0"
                    .to_string(),
            ));
        }

        if self.rate_limit_window.is_zero() || self.route_rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_SECS and ROUTE_RATE_LIMIT_WINDOW_SECS must be greater than 0"
                    .to_string(),
            ));
        }

        if self.csrf_token_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "CSRF_TOKEN_TTL_SECS must be greater than 0".to_string(),
            ));
        }

        // tokio::time::interval panics on a zero period
        if self.csrf_sweep_interval.is_zero() || self.rate_limit_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "CSRF_SWEEP_SECS and RATE_LIMIT_SWEEP_SECS must be greater than 0".to_string(),
            ));
        }

        let durations = [
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window),
            ("ROUTE_RATE_LIMIT_WINDOW_SECS", self.route_rate_limit_window),
            ("RATE_LIMIT_SWEEP_SECS", self.rate_limit_sweep_interval),
            ("CSRF_TOKEN_TTL_SECS", self.csrf_token_ttl),
            ("CSRF_SWEEP_SECS", self.csrf_sweep_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| *d > MAX_DURATION) {
            return Err(AppError::ConfigError(format!(
                "{name} must be at most {} seconds",
                MAX_DURATION.as_secs()
            )));
        }

        if self.max_form_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_FORM_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins() -> Vec<String> {
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            // Rate limiting
            rate_limit_max_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            route_rate_limit_max_requests: 20,
            route_rate_limit_window: Duration::from_secs(60),
            rate_limit_sweep_interval: Duration::from_secs(60),
            // CSRF
            csrf_token_ttl: Duration::from_secs(24 * 60 * 60),
            csrf_sweep_interval: Duration::from_secs(60 * 60),
            max_form_body_size: 1024 * 1024, // 1MB
            // Security
            cors_allowed_origins: vec!["*".to_string()],
            // Observability
            log_level: "info".to_string(),
            log_json: false,
            metrics_port: 0,
        }
    }
}

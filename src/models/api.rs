use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Freshly issued CSRF token.
#[derive(Debug, Serialize, Deserialize)]
pub struct CsrfTokenResponse {
    /// Token to submit as the `csrf_token` form field or `X-CSRF-Token` header
    pub token: String,
}

/// Form accepted by the echo endpoint.
///
/// The `csrf_token` field is consumed by the CSRF layer and ignored here.
#[derive(Debug, Deserialize)]
pub struct EchoForm {
    /// Text to echo back
    pub text: String,
}

/// Echo endpoint response.
#[derive(Debug, Serialize, Deserialize)]
pub struct EchoResponse {
    /// The submitted text
    pub text: String,
    /// Correlation ID of the request, if one was assigned
    pub request_id: Option<String>,
}

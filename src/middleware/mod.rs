//! HTTP middleware for request admission, security headers, and observability.
//!
//! This module provides the building blocks the [`chain`](crate::chain)
//! presets are assembled from:
//!
//! - **CSRF**: Token issuance and validation on state-changing requests
//! - **Rate Limiting**: Per-client fixed-window counting
//! - **Security Headers**: CSP, framing, sniffing, referrer and HSTS headers
//! - **CORS**: Access-Control headers and preflight short-circuit
//! - **Recovery**: Panics turned into `500 Internal Server Error`
//! - **Request Log**: Request IDs and start/completion events
//!
//! # Architecture
//!
//! ```text
//! Request → Security → CSRF → Rate Limiter → CORS → Recovery → Log → Handler
//!                        ↓          ↓           ↓        ↓         ↓
//!                  403 Forbidden  429 Too    OPTIONS   500      X-Request-ID
//!                                 Many       200
//! ```
//!
//! # Security Considerations
//!
//! - Tokens come from the OS random source and are compared by exact lookup
//! - Rejections use static bodies that reveal nothing about internal state
//! - Client keys trust forwarding headers; see [`ip`] for the deployment caveat

pub mod capture;
pub mod cors;
pub mod csrf;
pub mod ip;
pub mod rate_limit;
pub mod recovery;
pub mod request_log;
pub mod security_headers;

pub use capture::ResponseCapture;
pub use cors::CorsLayer;
pub use csrf::{CSRF_FORM_FIELD, CSRF_HEADER, CsrfGuard, CsrfLayer};
pub use ip::{UNKNOWN_CLIENT, client_key, client_key_with_source};
pub use rate_limit::{Decision, FixedWindowLimiter, RateLimitError, RateLimitLayer};
pub use recovery::RecoveryLayer;
pub use request_log::{REQUEST_ID_HEADER, RequestIdExt, RequestLogLayer};
pub use security_headers::SecurityHeadersLayer;

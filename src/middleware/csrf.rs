//! CSRF token issuance and validation.
//!
//! # Token Lifecycle
//!
//! ```text
//!   absent ──issue──▶ valid ──validate (before expiry)──▶ valid
//!                       │
//!                       ├──validate (at/after expiry)──▶ evicted
//!                       └──periodic sweep (expired)────▶ evicted
//! ```
//!
//! - Tokens are 32 bytes from the OS random source, hex-encoded (64 chars)
//! - A token stays valid until its TTL (default 24h) elapses
//! - Validation does not consume the token; it can be reused until expiry
//! - Issuance is not tied to a client or session: every call mints a new token
//!
//! # Request Check
//!
//! `GET`, `HEAD` and `OPTIONS` pass through unchecked. Every other method must
//! carry a valid token in the `csrf_token` form field of an
//! `application/x-www-form-urlencoded` body, or in the `X-CSRF-Token` header
//! when the field is missing or empty. Multipart uploads are not buffered, so
//! they must use the header.
//!
//! Failed checks answer `403 Forbidden` with a static body; the inner service
//! is never called.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use chrono::Utc;
use http_body_util::LengthLimitError;
use rand::TryRngCore;
use rand::rngs::OsRng;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::state::BackgroundTasks;
use crate::store::{ExpiringStore, spawn_sweeper};

/// Form field carrying the token.
pub const CSRF_FORM_FIELD: &str = "csrf_token";

/// Header carrying the token when the form field is absent.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Static body for rejected requests.
pub const CSRF_REJECTED_MESSAGE: &str = "Forbidden - Invalid CSRF token";

/// Number of random bytes in a token.
const TOKEN_BYTES: usize = 32;

/// Issues and validates CSRF tokens.
///
/// Cheap to clone; clones share the same token store.
#[derive(Debug, Clone)]
pub struct CsrfGuard {
    tokens: Arc<ExpiringStore<String, ()>>,
    ttl: Duration,
}

impl CsrfGuard {
    /// Create a guard whose tokens live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(ExpiringStore::new()),
            ttl,
        }
    }

    /// Mint a new token and remember it for the configured TTL.
    pub fn issue_token(&self) -> String {
        let token = generate_token();
        self.tokens.put(token.clone(), (), self.ttl);
        token
    }

    /// Token to embed in a page rendered for `req`.
    ///
    /// Always mints a new token; the request is not inspected.
    pub fn token_for_request<B>(&self, _req: &Request<B>) -> String {
        self.issue_token()
    }

    /// Check a submitted token.
    ///
    /// Empty and unknown tokens are invalid. An expired token is invalid and
    /// is evicted. A live token is valid and stays in place for reuse.
    pub fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.tokens.get(token).is_some()
    }

    /// Number of stored tokens, expired ones not yet evicted included.
    pub fn stored_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Start the periodic sweep of expired tokens on `tasks`.
    pub fn spawn_sweeper(&self, period: Duration, tasks: &BackgroundTasks) {
        spawn_sweeper(self.tokens.clone(), period, "csrf", tasks);
    }
}

/// Generate a token from the OS random source.
///
/// If the random source fails, fall back to a timestamp-derived value so the
/// caller still gets a token.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            warn!(error = %e, "OS random source unavailable, using timestamp-derived CSRF token");
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            hex::encode(nanos.to_be_bytes())
        }
    }
}

/// Methods that never require a token.
#[inline]
fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Whether the body is a url-encoded form.
fn is_urlencoded_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|mime| {
            mime.trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
}

/// Find the `csrf_token` field in a url-encoded body.
pub fn token_from_form(body: &[u8]) -> Option<String> {
    form_urlencoded::parse(body)
        .find(|(name, _)| name == CSRF_FORM_FIELD)
        .map(|(_, value)| value.into_owned())
}

/// Token from the `X-CSRF-Token` header.
fn token_from_header<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// Pull the submitted token out of `req`.
///
/// A url-encoded body is buffered (up to `max_body`) and re-attached so that
/// downstream extractors still see it.
async fn extract_token(
    req: Request<Body>,
    max_body: usize,
) -> Result<(Request<Body>, String), AppError> {
    let (parts, body) = req.into_parts();

    let (body, form_token) = if is_urlencoded_form(&parts.headers) {
        let bytes = to_bytes(body, max_body).await.map_err(body_read_error)?;
        let token = token_from_form(&bytes);
        (Body::from(bytes), token)
    } else {
        (body, None)
    };

    let req = Request::from_parts(parts, body);
    let token = form_token
        .filter(|t| !t.is_empty())
        .or_else(|| token_from_header(&req))
        .unwrap_or_default();

    Ok((req, token))
}

/// Map a buffering failure: only the length limit is a 413, anything else
/// (client went away, malformed chunking) is a bad request.
fn body_read_error(e: axum::Error) -> AppError {
    let over_limit = std::error::Error::source(&e)
        .is_some_and(|source| source.is::<LengthLimitError>());

    if over_limit {
        AppError::PayloadTooLarge(e.to_string())
    } else {
        AppError::BadRequest(format!("Failed to read request body: {e}"))
    }
}

/// Build the static 403 response.
fn forbidden_response() -> Response<Body> {
    (StatusCode::FORBIDDEN, CSRF_REJECTED_MESSAGE).into_response()
}

/// CSRF validation layer for Tower middleware stack.
#[derive(Clone)]
pub struct CsrfLayer {
    guard: CsrfGuard,
    max_body: usize,
}

impl CsrfLayer {
    /// Create a layer validating against `guard`, buffering at most
    /// `max_body` bytes of url-encoded form data.
    pub fn new(guard: CsrfGuard, max_body: usize) -> Self {
        Self { guard, max_body }
    }
}

impl<S> Layer<S> for CsrfLayer {
    type Service = CsrfService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CsrfService {
            inner,
            guard: self.guard.clone(),
            max_body: self.max_body,
        }
    }
}

/// CSRF validation service wrapper.
#[derive(Clone)]
pub struct CsrfService<S> {
    inner: S,
    guard: CsrfGuard,
    max_body: usize,
}

impl<S> Service<Request<Body>> for CsrfService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let guard = self.guard.clone();
        let max_body = self.max_body;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if is_safe_method(req.method()) {
                return inner.call(req).await;
            }

            let method = req.method().clone();
            let path = req.uri().path().to_string();

            let (req, token) = match extract_token(req, max_body).await {
                Ok(extracted) => extracted,
                Err(e) => return Ok(e.into_response()),
            };

            if guard.validate(&token) {
                debug!(method = %method, path = %path, "CSRF token accepted");
                inner.call(req).await
            } else {
                warn!(
                    method = %method,
                    path = %path,
                    token_present = !token.is_empty(),
                    "CSRF validation failed"
                );
                Ok(forbidden_response())
            }
        })
    }
}

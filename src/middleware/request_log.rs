//! Request ID assignment and structured request logging.
//!
//! # Features
//!
//! - Propagates an incoming `X-Request-ID` header unchanged
//! - Otherwise generates `<yyyymmddHHMMSS>-<8 hex chars>` (UTC)
//! - Stores the ID on the request so handlers can read it ([`RequestIdExt`])
//! - Echoes the ID on every response
//! - Logs `request started` and `request completed` events
//!
//! The completion event carries status, duration and body size; its level
//! follows the status class: 5xx at `error`, 4xx at `warn`, everything else at
//! `info`.
//!
//! # Client Usage
//!
//! ```bash
//! curl -H "X-Request-ID: my-correlation-id" http://localhost:8080/health
//! ```
//!
//! The same ID is returned in the response for correlation.

use std::net::SocketAddr;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Method, Request, Response};
use chrono::Utc;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::capture::ResponseCapture;
use super::ip::remote_addr;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Fallback header value when the ID is not a valid header value.
static UNKNOWN_REQUEST_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Request logging layer for Tower middleware stack.
#[derive(Clone, Debug, Default)]
pub struct RequestLogLayer;

impl RequestLogLayer {
    /// Create a new request logging layer.
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestLogLayer {
    type Service = RequestLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLogService { inner }
    }
}

/// Request logging service wrapper.
#[derive(Clone, Debug)]
pub struct RequestLogService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestLogService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = extract_or_generate_request_id(&req);
        let header_value =
            HeaderValue::from_str(&request_id).unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone());

        // Handlers read the ID back from the request headers
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let remote = remote_addr(&req);
        let started = Instant::now();

        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            remote_addr = ?remote,
            "request started"
        );

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let result = inner.call(req).await;
            let elapsed = started.elapsed();

            match result {
                Ok(mut response) => {
                    let capture = ResponseCapture::from_response(&response);
                    log_completion(&request_id, &method, &path, remote, capture, elapsed);
                    response
                        .headers_mut()
                        .insert(REQUEST_ID_HEADER, header_value);
                    Ok(response)
                }
                Err(e) => {
                    log_completion(
                        &request_id,
                        &method,
                        &path,
                        remote,
                        ResponseCapture::internal_error(),
                        elapsed,
                    );
                    Err(e)
                }
            }
        })
    }
}

/// Emit the completion event at a level matching the status class.
fn log_completion(
    request_id: &str,
    method: &Method,
    path: &str,
    remote: Option<SocketAddr>,
    capture: ResponseCapture,
    elapsed: std::time::Duration,
) {
    let status = capture.status.as_u16();
    let duration_ms = elapsed.as_secs_f64() * 1000.0;
    let bytes = capture.bytes;

    if capture.status.is_server_error() {
        error!(request_id, method = %method, path, remote_addr = ?remote, status, duration_ms, bytes, "request completed");
    } else if capture.status.is_client_error() {
        warn!(request_id, method = %method, path, remote_addr = ?remote, status, duration_ms, bytes, "request completed");
    } else {
        info!(request_id, method = %method, path, remote_addr = ?remote, status, duration_ms, bytes, "request completed");
    }
}

/// Extract request ID from headers or generate a new one.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> String {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.is_empty()
    {
        return value.to_string();
    }

    generate_request_id()
}

/// `<yyyymmddHHMMSS>-<8 hex chars>`, timestamp in UTC.
pub fn generate_request_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        random.get(..8).unwrap_or(&random)
    )
}

/// Extension trait to extract request ID from requests.
pub trait RequestIdExt {
    /// Get the request ID from the request headers.
    fn request_id(&self) -> Option<String>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<String> {
        self.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

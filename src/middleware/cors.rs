//! Cross-origin resource sharing, built on `tower_http::cors`.
//!
//! - `Access-Control-Allow-Origin`: `*`, or the request's `Origin` when it is
//!   in the configured list
//! - Preflight answers carry the allowed methods and headers (including
//!   `X-CSRF-Token` and `X-Request-ID`) and a one-day `Max-Age`
//! - Every response gets a `Content-Security-Policy` variant whose
//!   `connect-src` admits the configured origins and whose `media-src`
//!   admits `blob:`
//!
//! Any `OPTIONS` request is answered here with `200 OK` and an empty body;
//! the inner service never sees it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_SECURITY_POLICY, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use tower::{Layer, Service};
use tower_http::cors::{AllowOrigin, Any, Cors};
use tower_http::set_header::{SetResponseHeader, SetResponseHeaderLayer};
use tracing::{trace, warn};

use crate::middleware::csrf::CSRF_HEADER;
use crate::middleware::request_log::REQUEST_ID_HEADER;

const ALLOW_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

const MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Policy with `connect-src` opened to `connect_src`.
fn content_security_policy(connect_src: &str) -> HeaderValue {
    let policy = format!(
        "default-src 'self'; connect-src 'self' {connect_src}; media-src 'self' blob:; \
         img-src 'self' data:; style-src 'self' 'unsafe-inline'; frame-ancestors 'none'"
    );
    HeaderValue::from_str(&policy).unwrap_or_else(|_| HeaderValue::from_static("default-src 'self'"))
}

/// CORS layer for Tower middleware stack.
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
#[derive(Clone)]
pub struct CorsLayer {
    cors: tower_http::cors::CorsLayer,
    content_security_policy: SetResponseHeaderLayer<HeaderValue>,
}

impl CorsLayer {
    /// Build from configured origins; `["*"]` or an empty list allows any origin.
    pub fn new(allowed_origins: &[String]) -> Self {
        let allow_any = allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*");

        let (allow_origin, connect_src) = if allow_any {
            (AllowOrigin::from(Any), "*".to_string())
        } else {
            let origins: Vec<HeaderValue> = allowed_origins
                .iter()
                .filter_map(|o| match HeaderValue::from_str(o) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(origin = %o, "Invalid CORS origin, skipping");
                        None
                    }
                })
                .collect();
            (AllowOrigin::list(origins), allowed_origins.join(" "))
        };

        let cors = tower_http::cors::CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(ALLOW_METHODS)
            .allow_headers([
                CONTENT_TYPE,
                AUTHORIZATION,
                HeaderName::from_static(CSRF_HEADER),
                HeaderName::from_static(REQUEST_ID_HEADER),
            ])
            .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
            .max_age(MAX_AGE);

        Self {
            cors,
            content_security_policy: SetResponseHeaderLayer::overriding(
                CONTENT_SECURITY_POLICY,
                content_security_policy(&connect_src),
            ),
        }
    }

    /// Allow any origin.
    pub fn permissive() -> Self {
        Self::new(&[])
    }
}

impl fmt::Debug for CorsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorsLayer")
            .field("cors", &self.cors)
            .finish_non_exhaustive()
    }
}

/// Full CORS stack around `S`: policy header, `tower_http` CORS, then the
/// `OPTIONS` short-circuit.
pub type CorsService<S> = SetResponseHeader<Cors<OptionsService<S>>, HeaderValue>;

impl<S> Layer<S> for CorsLayer {
    type Service = CorsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        self.content_security_policy
            .layer(self.cors.layer(OptionsService { inner }))
    }
}

/// Answers `OPTIONS` requests that are not CORS preflights (those are
/// handled by `tower_http` before reaching this service).
#[derive(Clone, Debug)]
pub struct OptionsService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for OptionsService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if req.method() == Method::OPTIONS {
            trace!(path = %req.uri().path(), "Answering OPTIONS request");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::OK;
            return Box::pin(async move { Ok(response) });
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}

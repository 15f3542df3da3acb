//! Ordered middleware composition.
//!
//! A [`MiddlewareChain`] collects [`Middleware`] values in registration order
//! and composes them around a handler so that the **first registered runs
//! outermost**:
//!
//! ```text
//! chain.with(A).with(B).build(H)
//!
//! Request ──▶ A ──▶ B ──▶ H
//!                         │
//! Response ◀── A ◀── B ◀──┘
//! ```
//!
//! Any tower `Layer` becomes a middleware through [`Middleware::from_layer`];
//! ad-hoc logic can be written as an async function taking the request and a
//! [`Next`] through [`Middleware::from_fn`].
//!
//! # Router Integration
//!
//! [`MiddlewareChain::apply_to`] registers every middleware on a
//! [`MiddlewareRegistrar`] (implemented for axum `Router` and `MethodRouter`)
//! in the order that preserves first-registered-outermost, even though
//! `.layer()` itself makes the last call outermost.
//!
//! # Presets
//!
//! | Preset | Middlewares (outermost first) | Route class |
//! |---|---|---|
//! | [`global`] | security headers, rate limit, CORS, recovery, logging, metrics | every route |
//! | [`secure`] | security headers, CSRF, rate limit, recovery, logging | state-changing routes |
//! | [`public`] | CORS, recovery, logging, metrics | read-only routes |
//!
//! [`ChainConfig`] toggles the same pieces individually.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::routing::MethodRouter;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use tracing::debug;

use crate::metrics::{Metrics, MetricsLayer};
use crate::middleware::{
    CorsLayer, CsrfGuard, CsrfLayer, FixedWindowLimiter, RateLimitError, RateLimitLayer,
    RecoveryLayer, RequestLogLayer, SecurityHeadersLayer,
};
use crate::state::{AppState, BackgroundTasks};

/// Type-erased request handler: what a built chain (or any stage of it) is.
pub type BoxHandler = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

type WrapFn = dyn Fn(BoxHandler) -> BoxHandler + Send + Sync;

/// The rest of the chain, as seen from inside a [`Middleware::from_fn`] function.
pub struct Next {
    inner: BoxHandler,
}

impl Next {
    /// Pass `req` to the next middleware (or the handler) and return its response.
    pub async fn run(self, req: Request<Body>) -> Response<Body> {
        let Ok(response) = self.inner.oneshot(req).await;
        response
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// One wrapping step: takes the downstream handler, returns a handler that
/// runs its own logic around it.
///
/// Cheap to clone. Implements `tower::Layer`, so it can also be passed to
/// `Router::layer` directly.
#[derive(Clone)]
pub struct Middleware {
    name: &'static str,
    wrap: Arc<WrapFn>,
}

impl Middleware {
    /// Wrap a tower layer.
    pub fn from_layer<L>(name: &'static str, layer: L) -> Self
    where
        L: Layer<BoxHandler> + Send + Sync + 'static,
        L::Service: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Request<Body>>>::Future: Send + 'static,
    {
        Self {
            name,
            wrap: Arc::new(move |inner| BoxCloneSyncService::new(layer.layer(inner))),
        }
    }

    /// Build a middleware from an async function of the request and [`Next`].
    ///
    /// ```rust,ignore
    /// let tag = Middleware::from_fn("tag", |req, next: Next| async move {
    ///     let mut response = next.run(req).await;
    ///     response.headers_mut().insert("x-test", HeaderValue::from_static("1"));
    ///     response
    /// });
    /// ```
    pub fn from_fn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(Request<Body>, Next) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response<Body>> + Send + 'static,
    {
        Self {
            name,
            wrap: Arc::new(move |inner| {
                BoxCloneSyncService::new(FnService {
                    f: f.clone(),
                    inner,
                })
            }),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wrap `inner` with this middleware.
    pub fn wrap(&self, inner: BoxHandler) -> BoxHandler {
        (self.wrap)(inner)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for Middleware
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    type Service = BoxHandler;

    fn layer(&self, inner: S) -> Self::Service {
        self.wrap(BoxCloneSyncService::new(inner))
    }
}

/// Service behind [`Middleware::from_fn`].
#[derive(Clone)]
struct FnService<F> {
    f: F,
    inner: BoxHandler,
}

impl<F, Fut> Service<Request<Body>> for FnService<F>
where
    F: Fn(Request<Body>, Next) -> Fut,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the inner handler is awaited by `Next::run`
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let next = Next {
            inner: self.inner.clone(),
        };
        let future = (self.f)(req, next);
        Box::pin(async move { Ok(future.await) })
    }
}

/// Something middleware can be registered on.
///
/// `register` must make the newly registered middleware the outermost one,
/// which is what `.layer()` does for axum routers.
pub trait MiddlewareRegistrar: Sized {
    /// Add `middleware` outside everything registered so far.
    fn register(self, middleware: Middleware) -> Self;
}

impl<S> MiddlewareRegistrar for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn register(self, middleware: Middleware) -> Self {
        self.layer(middleware)
    }
}

impl<S> MiddlewareRegistrar for MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn register(self, middleware: Middleware) -> Self {
        self.layer(middleware)
    }
}

/// Ordered list of middlewares, composed around a handler by [`build`](Self::build).
#[derive(Clone, Debug, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Middleware>,
}

impl MiddlewareChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `middleware`; it runs inside everything appended before it.
    pub fn with(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Append the security headers middleware.
    pub fn security(self) -> Self {
        self.with(Middleware::from_layer(
            "security_headers",
            SecurityHeadersLayer::new(),
        ))
    }

    /// Append rate limiting against `limiter`.
    pub fn rate_limit(self, limiter: Arc<FixedWindowLimiter>) -> Self {
        self.with(Middleware::from_layer(
            "rate_limit",
            RateLimitLayer::new(limiter),
        ))
    }

    /// Append CORS handling.
    pub fn cors(self, cors: CorsLayer) -> Self {
        self.with(Middleware::from_layer("cors", cors))
    }

    /// Append panic recovery.
    pub fn recovery(self) -> Self {
        self.with(Middleware::from_layer("recovery", RecoveryLayer::new()))
    }

    /// Append request ID assignment and request logging.
    pub fn logging(self) -> Self {
        self.with(Middleware::from_layer("request_log", RequestLogLayer::new()))
    }

    /// Append metrics collection into `metrics`.
    pub fn metrics(self, metrics: Arc<Metrics>) -> Self {
        self.with(Middleware::from_layer("metrics", MetricsLayer::new(metrics)))
    }

    /// Append CSRF validation against `guard`.
    pub fn csrf(self, guard: CsrfGuard, max_form_body: usize) -> Self {
        self.with(Middleware::from_layer(
            "csrf",
            CsrfLayer::new(guard, max_form_body),
        ))
    }

    /// Names of the registered middlewares, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(Middleware::name).collect()
    }

    /// Number of registered middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Compose the chain around `handler`, first registered outermost.
    pub fn build<H>(self, handler: H) -> BoxHandler
    where
        H: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        H::Future: Send + 'static,
    {
        self.middlewares
            .iter()
            .rev()
            .fold(BoxCloneSyncService::new(handler), |inner, mw| mw.wrap(inner))
    }

    /// Register every middleware on `registrar`, first registered outermost.
    pub fn apply_to<R: MiddlewareRegistrar>(self, registrar: R) -> R {
        debug!(middlewares = ?self.names(), "Applying middleware chain");
        self.middlewares
            .into_iter()
            .rev()
            .fold(registrar, |registrar, mw| registrar.register(mw))
    }
}

/// Chain for every route: security headers, rate limit, CORS, recovery,
/// logging, metrics.
pub fn global(state: &AppState) -> MiddlewareChain {
    MiddlewareChain::new()
        .security()
        .rate_limit(state.global_limiter.clone())
        .cors(state.cors.clone())
        .recovery()
        .logging()
        .metrics(state.metrics.clone())
}

/// Chain for state-changing routes: security headers, CSRF, rate limit,
/// recovery, logging.
pub fn secure(state: &AppState) -> MiddlewareChain {
    MiddlewareChain::new()
        .security()
        .csrf(state.csrf.clone(), state.config.max_form_body_size)
        .rate_limit(state.route_limiter.clone())
        .recovery()
        .logging()
}

/// Chain for simple read-only routes: CORS, recovery, logging, metrics.
pub fn public(state: &AppState) -> MiddlewareChain {
    MiddlewareChain::new()
        .cors(state.cors.clone())
        .recovery()
        .logging()
        .metrics(state.metrics.clone())
}

/// Where a [`ChainConfig`] rate limit comes from.
#[derive(Debug, Clone)]
enum RateLimitSetting {
    Shared(Arc<FixedWindowLimiter>),
    AdHoc { max_requests: u32, window: Duration },
}

/// Builder for chains that pick their pieces individually.
///
/// Everything starts disabled. Enabled pieces are assembled in the preset
/// order: security headers, CSRF, rate limit, CORS, recovery, logging,
/// metrics.
///
/// ```rust,ignore
/// let chain = ChainConfig::new()
///     .security_headers(true)
///     .csrf(state.csrf.clone(), 64 * 1024)
///     .rate_limit(5, Duration::from_secs(60))
///     .recovery(true)
///     .build(state.tasks())?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    security_headers: bool,
    csrf: Option<(CsrfGuard, usize)>,
    rate_limit: Option<RateLimitSetting>,
    cors: Option<CorsLayer>,
    recovery: bool,
    logging: bool,
    metrics: Option<Arc<Metrics>>,
}

impl ChainConfig {
    /// Start with every piece disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle security headers.
    pub fn security_headers(mut self, enabled: bool) -> Self {
        self.security_headers = enabled;
        self
    }

    /// Enable CSRF validation.
    pub fn csrf(mut self, guard: CsrfGuard, max_form_body: usize) -> Self {
        self.csrf = Some((guard, max_form_body));
        self
    }

    /// Disable CSRF validation.
    pub fn without_csrf(mut self) -> Self {
        self.csrf = None;
        self
    }

    /// Rate limit with a limiter of its own, created at build time.
    pub fn rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimitSetting::AdHoc {
            max_requests,
            window,
        });
        self
    }

    /// Rate limit against an existing (possibly shared) limiter.
    pub fn shared_rate_limit(mut self, limiter: Arc<FixedWindowLimiter>) -> Self {
        self.rate_limit = Some(RateLimitSetting::Shared(limiter));
        self
    }

    /// Enable CORS handling.
    pub fn cors(mut self, cors: CorsLayer) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Toggle panic recovery.
    pub fn recovery(mut self, enabled: bool) -> Self {
        self.recovery = enabled;
        self
    }

    /// Toggle request logging.
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Enable metrics collection.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the chain.
    ///
    /// An ad-hoc limiter gets a sweeper on `tasks` running once per window.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError` if an ad-hoc rate limit has a zero request
    /// count or window.
    pub fn build(self, tasks: &BackgroundTasks) -> Result<MiddlewareChain, RateLimitError> {
        let mut chain = MiddlewareChain::new();

        if self.security_headers {
            chain = chain.security();
        }
        if let Some((guard, max_form_body)) = self.csrf {
            chain = chain.csrf(guard, max_form_body);
        }
        match self.rate_limit {
            Some(RateLimitSetting::Shared(limiter)) => chain = chain.rate_limit(limiter),
            Some(RateLimitSetting::AdHoc {
                max_requests,
                window,
            }) => {
                let limiter = Arc::new(FixedWindowLimiter::new(max_requests, window)?);
                limiter.spawn_sweeper(window, tasks);
                chain = chain.rate_limit(limiter);
            }
            None => {}
        }
        if let Some(cors) = self.cors {
            chain = chain.cors(cors);
        }
        if self.recovery {
            chain = chain.recovery();
        }
        if self.logging {
            chain = chain.logging();
        }
        if let Some(metrics) = self.metrics {
            chain = chain.metrics(metrics);
        }

        Ok(chain)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method, StatusCode, header};
    use axum::routing::get;
    use parking_lot::Mutex;
    use tower::service_fn;

    use crate::config::Config;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn ok_handler() -> BoxHandler {
        BoxCloneSyncService::new(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("ok")))
        }))
    }

    fn recording(name: &'static str, trace: &Trace) -> Middleware {
        let trace = trace.clone();
        Middleware::from_fn(name, move |req, next: Next| {
            let trace = trace.clone();
            async move {
                trace.lock().push(format!("{name}-before"));
                let response = next.run(req).await;
                trace.lock().push(format!("{name}-after"));
                response
            }
        })
    }

    fn add_header(name: &'static str) -> Middleware {
        Middleware::from_fn("add_header", move |req, next: Next| async move {
            let mut response = next.run(req).await;
            response
                .headers_mut()
                .insert(name, HeaderValue::from_static("1"));
            response
        })
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_first_registered_runs_outermost() {
        let trace: Trace = Arc::default();
        let handler_trace = trace.clone();
        let handler = service_fn(move |_req: Request<Body>| {
            let trace = handler_trace.clone();
            async move {
                trace.lock().push("H".to_string());
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }
        });

        let app = MiddlewareChain::new()
            .with(recording("A", &trace))
            .with(recording("B", &trace))
            .build(handler);
        app.oneshot(get_request("/")).await.unwrap();

        assert_eq!(
            *trace.lock(),
            vec!["A-before", "B-before", "H", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_header_middleware_on_ok_handler() {
        let app = MiddlewareChain::new()
            .with(add_header("x-test"))
            .build(ok_handler());

        let response = app.oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-test"));
    }

    #[tokio::test]
    async fn test_empty_chain_is_the_handler() {
        let chain = MiddlewareChain::new();
        assert!(chain.is_empty());

        let response = chain.build(ok_handler()).oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_middlewares() {
        let trace: Trace = Arc::default();
        let deny = Middleware::from_fn("deny", |_req, _next: Next| async {
            let mut response = Response::new(Body::from("denied"));
            *response.status_mut() = StatusCode::FORBIDDEN;
            response
        });

        let app = MiddlewareChain::new()
            .with(recording("A", &trace))
            .with(deny)
            .with(recording("B", &trace))
            .build(ok_handler());
        let response = app.oneshot(get_request("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(*trace.lock(), vec!["A-before", "A-after"]);
    }

    #[tokio::test]
    async fn test_apply_to_router_preserves_order() {
        let trace: Trace = Arc::default();
        let handler_trace = trace.clone();
        let router = Router::new().route(
            "/",
            get(move || {
                let trace = handler_trace.clone();
                async move {
                    trace.lock().push("H".to_string());
                    "ok"
                }
            }),
        );

        let app = MiddlewareChain::new()
            .with(recording("A", &trace))
            .with(recording("B", &trace))
            .apply_to(router);
        app.oneshot(get_request("/")).await.unwrap();

        assert_eq!(
            *trace.lock(),
            vec!["A-before", "B-before", "H", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_apply_to_method_router() {
        let route = MiddlewareChain::new()
            .with(add_header("x-route"))
            .apply_to(get(|| async { "ok" }));
        let app = Router::new().route("/r", route).route("/plain", get(|| async { "ok" }));

        let response = app.clone().oneshot(get_request("/r")).await.unwrap();
        assert!(response.headers().contains_key("x-route"));

        let response = app.oneshot(get_request("/plain")).await.unwrap();
        assert!(!response.headers().contains_key("x-route"));
    }

    #[tokio::test]
    async fn test_recovery_in_chain_turns_panic_into_500() {
        let panicking = service_fn(|_req: Request<Body>| async {
            if true {
                panic!("boom");
            }
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });

        let app = MiddlewareChain::new()
            .with(add_header("x-outer"))
            .recovery()
            .build(panicking);
        let response = app.oneshot(get_request("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key("x-outer"));
    }

    #[tokio::test]
    async fn test_presets_contents() {
        let state = AppState::new(Config::default()).unwrap();

        assert_eq!(
            global(&state).names(),
            vec!["security_headers", "rate_limit", "cors", "recovery", "request_log", "metrics"]
        );
        assert_eq!(
            secure(&state).names(),
            vec!["security_headers", "csrf", "rate_limit", "recovery", "request_log"]
        );
        assert_eq!(
            public(&state).names(),
            vec!["cors", "recovery", "request_log", "metrics"]
        );

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_secure_preset_rejects_post_without_token() {
        let state = AppState::new(Config::default()).unwrap();
        let app = secure(&state).build(ok_handler());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("text=hi"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");

        let token = state.csrf.issue_token();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("text=hi&csrf_token={token}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_config_ad_hoc_rate_limit() {
        let tasks = BackgroundTasks::new();
        let chain = ChainConfig::new()
            .security_headers(true)
            .rate_limit(1, Duration::from_secs(60))
            .recovery(true)
            .build(&tasks)
            .unwrap();
        assert_eq!(chain.names(), vec!["security_headers", "rate_limit", "recovery"]);

        let app = chain.build(ok_handler());
        let first = app.clone().oneshot(get_request("/")).await.unwrap();
        let second = app.oneshot(get_request("/")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(tasks.len(), 1);

        tasks.shutdown().await;
    }

    #[test]
    fn test_chain_config_csrf_toggle() {
        let tasks = BackgroundTasks::new();
        let guard = CsrfGuard::new(Duration::from_secs(60));

        let with = ChainConfig::new().csrf(guard.clone(), 1024).build(&tasks).unwrap();
        let without = ChainConfig::new()
            .csrf(guard, 1024)
            .without_csrf()
            .build(&tasks)
            .unwrap();

        assert_eq!(with.names(), vec!["csrf"]);
        assert!(without.is_empty());
    }

    #[test]
    fn test_chain_config_rejects_zero_rate_limit() {
        let tasks = BackgroundTasks::new();
        let result = ChainConfig::new()
            .rate_limit(0, Duration::from_secs(60))
            .build(&tasks);

        assert!(matches!(result, Err(RateLimitError::ZeroMaxRequests)));
    }
}

//! Panic recovery.
//!
//! Turns a panic anywhere downstream into `500 Internal Server Error` with a
//! static body, so one faulty handler cannot take the connection (or the
//! server) down with it.
//!
//! Both ways a service can panic are covered:
//!
//! - Synchronously inside `Service::call`, while the future is being built
//! - While the returned future is being polled
//!
//! The panic message, method, path, peer address and a backtrace are logged
//! at `error`. Unwinding must be enabled (`panic = "unwind"`) for this layer
//! to have any effect.

use std::any::Any;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures::FutureExt;
use tower::{Layer, Service};
use tracing::error;

use super::ip::remote_addr;

/// Static body for recovered panics.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Log a caught panic and build the 500 response.
fn recovered(
    payload: Box<dyn Any + Send>,
    method: &Method,
    path: &str,
    remote: Option<SocketAddr>,
) -> Response<Body> {
    let backtrace = Backtrace::force_capture();
    error!(
        panic = %panic_message(payload.as_ref()),
        method = %method,
        path = %path,
        remote_addr = ?remote,
        backtrace = %backtrace,
        "Recovered from panic in request handler"
    );

    (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE).into_response()
}

/// Panic recovery layer for Tower middleware stack.
#[derive(Clone, Debug, Default)]
pub struct RecoveryLayer;

impl RecoveryLayer {
    /// Create a new recovery layer.
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

/// Panic recovery service wrapper.
#[derive(Clone, Debug)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RecoveryService<S>
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
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let remote = remote_addr(&req);
        let mut inner = self.inner.clone();

        let future = catch_unwind(AssertUnwindSafe(move || inner.call(req)));

        Box::pin(async move {
            let future = match future {
                Ok(future) => future,
                Err(payload) => return Ok(recovered(payload, &method, &path, remote)),
            };

            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Ok(recovered(payload, &method, &path, remote)),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::future::Ready;

    use axum::Router;
    use axum::body::to_bytes;
    use axum::routing::get;
    use tower::ServiceExt;

    async fn boom() -> &'static str {
        panic!("handler exploded");
    }

    fn app() -> Router {
        Router::new()
            .route("/panic", get(boom))
            .route("/ok", get(|| async { "ok" }))
            .layer(RecoveryLayer::new())
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    /// Service that panics before returning a future.
    #[derive(Clone)]
    struct PanicsOnCall;

    impl Service<Request<Body>> for PanicsOnCall {
        type Response = Response<Body>;
        type Error = Infallible;
        type Future = Ready<Result<Response<Body>, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            panic!("failed while building the future");
        }
    }

    #[tokio::test]
    async fn test_panic_while_polling_becomes_500() {
        let response = app().oneshot(get_request("/panic")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], INTERNAL_ERROR_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_panic_in_call_becomes_500() {
        let service = RecoveryLayer::new().layer(PanicsOnCall);
        let response = service.oneshot(get_request("/any")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_server_keeps_serving_after_panic() {
        let app = app();

        let first = app.clone().oneshot(get_request("/panic")).await.unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let second = app.oneshot(get_request("/ok")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[test]
    fn test_panic_message_variants() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(static_str.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}

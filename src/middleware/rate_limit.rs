//! Per-client fixed-window rate limiting.
//!
//! # Algorithm
//!
//! Each client key owns a bucket `{count, window_end}`:
//!
//! - No bucket, or `now >= window_end`: `count = 1`, `window_end = now + window`, allow
//! - Otherwise: `count += 1`; reject when `count > max_requests`
//!
//! Rejected requests still increment the counter, so `count` keeps growing
//! past the limit until the window ends. A fixed window admits up to twice the
//! configured rate across a window boundary in exchange for O(1) bookkeeping.
//!
//! Buckets live in an [`ExpiringStore`] whose entry expiry is the window end;
//! stale buckets are reaped by a periodic sweeper.
//!
//! # Response
//!
//! On rejection the layer answers `429 Too Many Requests` with a static body
//! and a `Retry-After` header, and the inner service is not called.
//!
//! # Client Identity
//!
//! Keys come from [`client_key`](super::ip::client_key); see that module for
//! the header trust caveats.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::client_key;
use crate::state::BackgroundTasks;
use crate::store::{ExpiringStore, spawn_sweeper};

/// Static body for rejected requests.
pub const RATE_LIMITED_MESSAGE: &str = "Too Many Requests";

/// Error type for rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// `max_requests` cannot be zero.
    ZeroMaxRequests,
    /// The window cannot be zero-length.
    ZeroWindow,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroMaxRequests => {
                write!(f, "max_requests must be greater than 0")
            }
            RateLimitError::ZeroWindow => write!(f, "rate limit window must be non-zero"),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Outcome of counting one request against a client's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Within the limit.
    Allowed {
        /// Requests counted in the current window, this one included.
        count: u64,
    },
    /// Over the limit.
    Rejected {
        /// Requests counted in the current window, this one included.
        count: u64,
        /// Time until the window ends.
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Requests counted in the current window.
    pub fn count(&self) -> u64 {
        match *self {
            Decision::Allowed { count } | Decision::Rejected { count, .. } => count,
        }
    }
}

/// Fixed-window request counter keyed by client.
///
/// Independent instances can coexist, e.g. a loose global limiter and a
/// stricter one for state-changing routes.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    buckets: Arc<ExpiringStore<String, u64>>,
    max_requests: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    /// Create a limiter allowing `max_requests` per `window` per client.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError` if either argument is zero.
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, RateLimitError> {
        if max_requests == 0 {
            return Err(RateLimitError::ZeroMaxRequests);
        }
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }

        Ok(Self {
            buckets: Arc::new(ExpiringStore::new()),
            max_requests,
            window,
        })
    }

    /// Count one request from `key` and decide whether it is admitted.
    pub fn check(&self, key: &str) -> Decision {
        let (count, window_end) =
            self.buckets
                .hit(key.to_string(), self.window, || 1, |count| *count += 1);

        if count > u64::from(self.max_requests) {
            Decision::Rejected {
                count,
                retry_after: window_end.saturating_duration_since(Instant::now()),
            }
        } else {
            Decision::Allowed { count }
        }
    }

    /// Configured requests per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Configured window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of buckets currently held, stale ones included.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Start the periodic sweep of stale buckets on `tasks`.
    pub fn spawn_sweeper(&self, period: Duration, tasks: &BackgroundTasks) {
        spawn_sweeper(self.buckets.clone(), period, "rate_limit", tasks);
    }
}

/// Build the static 429 response.
fn rate_limited_response(retry_after: Duration) -> Response<Body> {
    let retry_after_secs = retry_after.as_secs().max(1);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_secs.to_string())],
        RATE_LIMITED_MESSAGE,
    )
        .into_response()
}

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(FixedWindowLimiter::new(100, Duration::from_secs(60))?);
/// let app = Router::new()
///     .route("/upload", post(handler))
///     .layer(RateLimitLayer::new(limiter));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<FixedWindowLimiter>,
}

impl RateLimitLayer {
    /// Create a layer enforcing `limiter`.
    pub fn new(limiter: Arc<FixedWindowLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<FixedWindowLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        // Convert Cow to String so the key can move into the future
        let key = client_key(&req).into_owned();

        Box::pin(async move {
            match limiter.check(&key) {
                Decision::Allowed { count } => {
                    debug!(client = %key, count, "Rate limit check passed");
                    inner.call(req).await
                }
                Decision::Rejected { count, retry_after } => {
                    warn!(
                        client = %key,
                        path = %req.uri().path(),
                        count,
                        limit = limiter.max_requests(),
                        window_secs = limiter.window().as_secs(),
                        retry_after_secs = retry_after.as_secs(),
                        "Rate limit exceeded"
                    );

                    Ok(rate_limited_response(retry_after))
                }
            }
        })
    }
}

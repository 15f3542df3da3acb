//! Request metrics: an in-process snapshot plus the Prometheus facade.
//!
//! The [`Metrics`] collector keeps per-path counters, an active-request
//! gauge, rolling response times and error counts in memory, and serves them
//! as a serializable [`MetricsSnapshot`]. The same events are forwarded to the
//! `metrics` facade so an optional Prometheus exporter can scrape them.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `scribe_http_requests_total` - Requests handled (labels: path, method, status)
//! - `scribe_feature_usage_total` - Business actions recorded by handlers (label: action)
//!
//! ## Histograms
//! - `scribe_http_request_duration_seconds` - Request duration (labels: path, method, status)
//!
//! ## Gauges
//! - `scribe_http_requests_active` - Requests currently in flight
//!
//! # Usage
//!
//! ```rust,ignore
//! use scribe_web::metrics::{Metrics, MetricsLayer, try_init_metrics};
//!
//! // Optional: expose the facade on a Prometheus endpoint
//! try_init_metrics("0.0.0.0:9090".parse()?);
//!
//! let metrics = Arc::new(Metrics::new());
//! let app = Router::new().route("/", get(handler)).layer(MetricsLayer::new(metrics.clone()));
//!
//! // In a handler
//! metrics.record_feature("transcribe");
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{error, info};

use crate::middleware::capture::ResponseCapture;

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "scribe_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "scribe_http_request_duration_seconds";
    pub const HTTP_REQUESTS_ACTIVE: &str = "scribe_http_requests_active";
    pub const FEATURE_USAGE_TOTAL: &str = "scribe_feature_usage_total";
}

/// Response-time samples kept per path.
pub const MAX_DURATION_SAMPLES: usize = 100;

/// Path key for requests that matched no route (404 fallback).
pub const UNMATCHED_PATH: &str = "unmatched";

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener on
/// `metrics_addr`.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (address in use, a
/// recorder already installed).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::HTTP_REQUESTS_TOTAL, "Total number of HTTP requests handled");
    describe_counter!(
        names::FEATURE_USAGE_TOTAL,
        "Total number of business actions performed, by action"
    );
    describe_histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_gauge!(
        names::HTTP_REQUESTS_ACTIVE,
        "Number of HTTP requests currently being processed"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Point-in-time copy of the collected metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests seen per matched route (`unmatched` for the 404 fallback).
    pub total_requests: HashMap<String, u64>,
    /// Requests currently in flight.
    pub active_requests: i64,
    /// Error responses keyed by `"{path}_{status}"`.
    pub error_counts: HashMap<String, u64>,
    /// Business actions recorded by handlers.
    pub feature_usage: HashMap<String, u64>,
    /// Mean of the retained response-time samples per path, in milliseconds.
    pub avg_response_time_ms: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: HashMap<String, u64>,
    active_requests: i64,
    response_times: HashMap<String, VecDeque<Duration>>,
    error_counts: HashMap<String, u64>,
    feature_usage: HashMap<String, u64>,
}

/// In-process metrics collector.
///
/// Request-derived fields are updated only by [`MetricsLayer`]; feature usage
/// only through [`Metrics::record_feature`].
#[derive(Debug, Default)]
pub struct Metrics {
    state: Mutex<MetricsState>,
}

impl Metrics {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one use of a business action.
    pub fn record_feature(&self, action: &str) {
        *self
            .state
            .lock()
            .feature_usage
            .entry(action.to_string())
            .or_insert(0) += 1;

        counter!(names::FEATURE_USAGE_TOTAL, "action" => action.to_string()).increment(1);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();

        let avg_response_time_ms = state
            .response_times
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(path, samples)| {
                let total: Duration = samples.iter().sum();
                let avg_ms = total.as_secs_f64() * 1000.0 / samples.len() as f64;
                (path.clone(), avg_ms)
            })
            .collect();

        MetricsSnapshot {
            total_requests: state.total_requests.clone(),
            active_requests: state.active_requests,
            error_counts: state.error_counts.clone(),
            feature_usage: state.feature_usage.clone(),
            avg_response_time_ms,
        }
    }

    fn request_started(&self, path: &str) {
        {
            let mut state = self.state.lock();
            *state.total_requests.entry(path.to_string()).or_insert(0) += 1;
            state.active_requests += 1;
        }

        gauge!(names::HTTP_REQUESTS_ACTIVE).increment(1.0);
    }

    fn request_abandoned(&self) {
        self.state.lock().active_requests -= 1;
        gauge!(names::HTTP_REQUESTS_ACTIVE).decrement(1.0);
    }

    fn request_finished(
        &self,
        path: &str,
        method: &str,
        capture: ResponseCapture,
        elapsed: Duration,
    ) {
        let status = capture.status.as_u16();

        {
            let mut state = self.state.lock();
            state.active_requests -= 1;

            let samples = state.response_times.entry(path.to_string()).or_default();
            if samples.len() >= MAX_DURATION_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(elapsed);

            if capture.is_error() {
                *state
                    .error_counts
                    .entry(format!("{path}_{status}"))
                    .or_insert(0) += 1;
            }
        }

        gauge!(names::HTTP_REQUESTS_ACTIVE).decrement(1.0);
        counter!(
            names::HTTP_REQUESTS_TOTAL,
            "path" => path.to_string(),
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            names::HTTP_REQUEST_DURATION_SECONDS,
            "path" => path.to_string(),
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Metrics collection layer for Tower middleware stack.
#[derive(Clone, Debug)]
pub struct MetricsLayer {
    metrics: Arc<Metrics>,
}

impl MetricsLayer {
    /// Create a layer recording into `metrics`.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

/// Metrics collection service wrapper.
#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<Metrics>,
}

impl<S> Service<Request<Body>> for MetricsService<S>
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
        let path = route_key(&req);
        let method = req.method().to_string();
        let mut inner = self.inner.clone();

        self.metrics.request_started(&path);
        let in_flight = InFlight {
            metrics: self.metrics.clone(),
            path,
            method,
            started: Instant::now(),
            outcome: None,
        };

        Box::pin(async move {
            let mut in_flight = in_flight;
            let result = inner.call(req).await;
            in_flight.complete(match &result {
                Ok(response) => ResponseCapture::from_response(response),
                Err(_) => ResponseCapture::internal_error(),
            });
            result
        })
    }
}

/// Route template the request matched, so that keys stay bounded by the
/// route table rather than by what clients send.
fn route_key<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map_or_else(|| UNMATCHED_PATH.to_string(), |matched| matched.as_str().to_string())
}

/// Completes a request's metrics when dropped.
///
/// A request that unwinds through this layer (a panic caught further out)
/// is recorded as a 500; one whose future is dropped before completion
/// (client went away) only leaves the active gauge.
struct InFlight {
    metrics: Arc<Metrics>,
    path: String,
    method: String,
    started: Instant,
    outcome: Option<ResponseCapture>,
}

impl InFlight {
    fn complete(&mut self, capture: ResponseCapture) {
        self.outcome = Some(capture);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let capture = match self.outcome.take() {
            Some(capture) => capture,
            None if std::thread::panicking() => ResponseCapture::internal_error(),
            None => {
                self.metrics.request_abandoned();
                return;
            }
        };
        self.metrics
            .request_finished(&self.path, &self.method, capture, self.started.elapsed());
    }
}

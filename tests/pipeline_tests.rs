//! End-to-end tests of the full router, driven in-process.
//!
//! Requests go through `build_router` with `tower::ServiceExt::oneshot`, so
//! every middleware in the global and secure chains is exercised without
//! binding a socket. Time-dependent cases run on a paused tokio clock.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, Response, StatusCode, header};
use serde_json::Value;
use tokio::time::advance;
use tower::ServiceExt;

use scribe_web::middleware::csrf::CSRF_REJECTED_MESSAGE;
use scribe_web::middleware::rate_limit::RATE_LIMITED_MESSAGE;
use scribe_web::models::{CsrfTokenResponse, EchoResponse};
use scribe_web::{AppState, Config, build_router};

const FORM: &str = "application/x-www-form-urlencoded";

/// Router plus the state behind it, for direct inspection and shutdown.
struct Pipeline {
    app: Router,
    state: AppState,
}

impl Pipeline {
    fn new(config: Config) -> Self {
        let state = AppState::new(config).expect("valid config");
        let app = build_router(state.clone());
        Self { app, state }
    }

    async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(req).await.unwrap()
    }

    async fn get(&self, path: &str, client: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .uri(path)
                .header("x-forwarded-for", client)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn fetch_token(&self) -> String {
        let response = self.get("/csrf-token", "10.0.0.1").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: CsrfTokenResponse = json_body(response).await;
        body.token
    }

    async fn post_form(&self, body: String, client: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/echo")
                .header(header::CONTENT_TYPE, FORM)
                .header("x-forwarded-for", client)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    async fn shutdown(self) {
        self.state.shutdown().await;
    }
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response<Body>) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Global chain
// =============================================================================

#[tokio::test]
async fn test_health_carries_global_headers() {
    let pipeline = Pipeline::new(Config::default());

    let response = pipeline.get("/health", "10.0.0.1").await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert!(headers.contains_key("x-request-id"));
    // CORS variant of the policy wins over the default one
    assert!(
        headers
            .get("content-security-policy")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("blob:")
    );

    let body: Value = json_body(response).await;
    assert_eq!(body["status"], "healthy");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unknown_route_still_passes_global_chain() {
    let pipeline = Pipeline::new(Config::default());

    let response = pipeline.get("/nope", "10.0.0.1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let pipeline = Pipeline::new(Config::default());

    let response = pipeline
        .send(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-me-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-me-123");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_preflight_answered_without_csrf() {
    let pipeline = Pipeline::new(Config::default());

    let response = pipeline
        .send(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/echo")
                .header("origin", "https://app.example.com")
                .header("access-control-request-method", "POST")
                .header("access-control-request-headers", "x-csrf-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("access-control-allow-headers")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("x-csrf-token")
    );
    assert!(body_text(response).await.is_empty());

    pipeline.shutdown().await;
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_global_limit_per_client() {
    let pipeline = Pipeline::new(Config {
        rate_limit_max_requests: 2,
        rate_limit_window: Duration::from_secs(60),
        ..Config::default()
    });

    let mut statuses = Vec::new();
    for _ in 0..3 {
        statuses.push(pipeline.get("/health", "192.168.1.1").await.status());
    }
    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );

    // Other clients are unaffected
    for client in ["192.168.1.2", "192.168.1.2"] {
        assert_eq!(pipeline.get("/health", client).await.status(), StatusCode::OK);
    }

    // Window rolls over
    advance(Duration::from_secs(60)).await;
    assert_eq!(
        pipeline.get("/health", "192.168.1.1").await.status(),
        StatusCode::OK
    );

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejection_body_and_retry_after() {
    let pipeline = Pipeline::new(Config {
        rate_limit_max_requests: 1,
        ..Config::default()
    });

    pipeline.get("/health", "192.168.1.1").await;
    advance(Duration::from_secs(15)).await;
    let response = pipeline.get("/health", "192.168.1.1").await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("retry-after").unwrap(), "45");
    // Security headers wrap even rejections
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    assert_eq!(body_text(response).await, RATE_LIMITED_MESSAGE);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_route_limiter_is_stricter_on_echo() {
    let pipeline = Pipeline::new(Config {
        route_rate_limit_max_requests: 1,
        ..Config::default()
    });
    let token = pipeline.fetch_token().await;

    let first = pipeline
        .post_form(format!("text=one&csrf_token={token}"), "192.168.1.9")
        .await;
    let second = pipeline
        .post_form(format!("text=two&csrf_token={token}"), "192.168.1.9")
        .await;

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    // Reads are still governed by the looser global limiter
    assert_eq!(pipeline.get("/health", "192.168.1.9").await.status(), StatusCode::OK);

    pipeline.shutdown().await;
}

// =============================================================================
// CSRF
// =============================================================================

#[tokio::test]
async fn test_echo_with_form_token() {
    let pipeline = Pipeline::new(Config::default());
    let token = pipeline.fetch_token().await;

    let response = pipeline
        .post_form(format!("text=hello+world&csrf_token={token}"), "10.0.0.1")
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let request_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body: EchoResponse = json_body(response).await;
    assert_eq!(body.text, "hello world");
    assert_eq!(body.request_id.as_deref(), Some(request_id.as_str()));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_echo_with_header_token() {
    let pipeline = Pipeline::new(Config::default());
    let token = pipeline.fetch_token().await;

    let response = pipeline
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/echo")
                .header(header::CONTENT_TYPE, FORM)
                .header("x-csrf-token", token)
                .body(Body::from("text=via-header"))
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: EchoResponse = json_body(response).await;
    assert_eq!(body.text, "via-header");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_echo_without_token_is_forbidden() {
    let pipeline = Pipeline::new(Config::default());

    let response = pipeline.post_form("text=hello".to_string(), "10.0.0.1").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_text(response).await, CSRF_REJECTED_MESSAGE);

    let response = pipeline
        .post_form("text=hello&csrf_token=forged".to_string(), "10.0.0.1")
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_token_is_reusable() {
    let pipeline = Pipeline::new(Config::default());
    let token = pipeline.fetch_token().await;

    for _ in 0..3 {
        let response = pipeline
            .post_form(format!("text=again&csrf_token={token}"), "10.0.0.1")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_token_expires_after_ttl() {
    let pipeline = Pipeline::new(Config::default());
    let token = pipeline.fetch_token().await;

    advance(Duration::from_secs(24 * 60 * 60 - 1)).await;
    let response = pipeline
        .post_form(format!("text=still&csrf_token={token}"), "10.0.0.1")
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    advance(Duration::from_secs(1)).await;
    let response = pipeline
        .post_form(format!("text=late&csrf_token={token}"), "10.0.0.1")
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(pipeline.state.csrf.stored_tokens(), 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_empty_text_is_bad_request() {
    let pipeline = Pipeline::new(Config::default());
    let token = pipeline.fetch_token().await;

    let response = pipeline
        .post_form(format!("text=&csrf_token={token}"), "10.0.0.1")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = json_body(response).await;
    assert_eq!(body["error"], "bad_request");

    pipeline.shutdown().await;
}

// =============================================================================
// Metrics
// =============================================================================

#[tokio::test]
async fn test_metrics_snapshot_reflects_traffic() {
    let pipeline = Pipeline::new(Config::default());
    let token = pipeline.fetch_token().await;

    pipeline.get("/health", "10.0.0.1").await;
    pipeline.get("/health", "10.0.0.1").await;
    pipeline.post_form("text=x".to_string(), "10.0.0.1").await;
    pipeline
        .post_form(format!("text=x&csrf_token={token}"), "10.0.0.1")
        .await;

    let response = pipeline.get("/metrics", "10.0.0.1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot: Value = json_body(response).await;

    assert_eq!(snapshot["total_requests"]["/health"], 2);
    assert_eq!(snapshot["total_requests"]["/echo"], 2);
    assert_eq!(snapshot["error_counts"]["/echo_403"], 1);
    assert_eq!(snapshot["feature_usage"]["echo"], 1);
    // The /metrics request itself is in flight
    assert_eq!(snapshot["active_requests"], 1);
    assert!(snapshot["avg_response_time_ms"]["/health"].is_number());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_scanned_paths_do_not_grow_metrics() {
    let pipeline = Pipeline::new(Config::default());

    for i in 0..50 {
        let response = pipeline.get(&format!("/nope-{i}"), "10.0.0.1").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    let response = pipeline
        .send(
            Request::builder()
                .method(Method::DELETE)
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let snapshot = pipeline.state.metrics.snapshot();
    assert_eq!(snapshot.total_requests.len(), 2);
    assert_eq!(snapshot.total_requests["unmatched"], 50);
    assert_eq!(snapshot.error_counts["unmatched_404"], 50);
    assert_eq!(snapshot.error_counts["/health_405"], 1);
    assert_eq!(snapshot.active_requests, 0);

    pipeline.shutdown().await;
}

//! Observed outcome of a response, for logging and metrics.

use axum::body::HttpBody;
use axum::http::{Response, StatusCode};

/// Status and size of a response as seen on its way back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCapture {
    /// Status code sent to the client.
    pub status: StatusCode,
    /// Body length when known up front (fixed-size bodies); `None` for streams.
    pub bytes: Option<u64>,
}

impl ResponseCapture {
    /// Capture status and body length without consuming the body.
    pub fn from_response<B: HttpBody>(response: &Response<B>) -> Self {
        Self {
            status: response.status(),
            bytes: response.body().size_hint().exact(),
        }
    }

    /// Outcome used when the downstream service never produced a response.
    pub const fn internal_error() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            bytes: None,
        }
    }

    /// Whether the status is 4xx or 5xx.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }
}

//! CSRF token issuance and the form echo endpoint.
//!
//! # Endpoints
//!
//! - `GET /csrf-token` - Issue a new token (every call mints a fresh one)
//! - `POST /echo` - Echo the `text` form field; guarded by the secure chain
//!
//! # Client Flow
//!
//! ```bash
//! TOKEN=$(curl -s http://localhost:8080/csrf-token | jq -r .token)
//! curl -d "text=hello&csrf_token=$TOKEN" http://localhost:8080/echo
//! ```

use axum::Json;
use axum::extract::{Form, Request, State};
use axum::http::HeaderMap;
use tracing::{debug, instrument};

use crate::error::{AppError, AppResult};
use crate::middleware::{REQUEST_ID_HEADER, RequestIdExt};
use crate::models::{CsrfTokenResponse, EchoForm, EchoResponse};
use crate::state::AppState;

/// Feature name recorded for each successful echo.
pub const ECHO_FEATURE: &str = "echo";

/// Maximum accepted length of the echoed text, in bytes.
pub const MAX_ECHO_TEXT_LEN: usize = 4096;

/// Issue a CSRF token.
///
/// # Response Body
///
/// ```json
/// { "token": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08" }
/// ```
#[instrument(skip_all)]
pub async fn issue_csrf_token(
    State(state): State<AppState>,
    req: Request,
) -> Json<CsrfTokenResponse> {
    let token = state.csrf.token_for_request(&req);
    debug!(request_id = ?req.request_id(), "Issued CSRF token");

    Json(CsrfTokenResponse { token })
}

/// Echo the submitted `text` field.
///
/// Reaching this handler means the CSRF and rate-limit checks passed.
///
/// # Errors
///
/// Returns `AppError::BadRequest` if `text` is empty or longer than
/// [`MAX_ECHO_TEXT_LEN`].
#[instrument(skip_all)]
pub async fn echo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<EchoForm>,
) -> AppResult<Json<EchoResponse>> {
    if form.text.is_empty() {
        return Err(AppError::BadRequest("text must not be empty".to_string()));
    }
    if form.text.len() > MAX_ECHO_TEXT_LEN {
        return Err(AppError::BadRequest(format!(
            "text exceeds {MAX_ECHO_TEXT_LEN} bytes"
        )));
    }

    state.metrics.record_feature(ECHO_FEATURE);

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(Json(EchoResponse {
        text: form.text,
        request_id,
    }))
}

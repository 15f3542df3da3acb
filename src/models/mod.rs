mod api;

pub use api::{CsrfTokenResponse, EchoForm, EchoResponse, HealthResponse};

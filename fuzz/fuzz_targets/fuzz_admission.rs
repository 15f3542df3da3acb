//! Fuzz target for the request admission inputs that come straight off the
//! wire: urlencoded form bodies, CSRF tokens and forwarding headers.
//!
//! None of these may panic, whatever the client sends.
//!
//! # Running
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_admission
//! cargo +nightly fuzz run fuzz_admission -- -max_total_time=60
//! ```

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use axum::body::Body;
use axum::http::{HeaderValue, Request};
use libfuzzer_sys::fuzz_target;
use scribe_web::middleware::csrf::token_from_form;
use scribe_web::middleware::{CsrfGuard, client_key};

#[derive(Debug, Arbitrary)]
struct AdmissionInput<'a> {
    form_body: &'a [u8],
    token: &'a str,
    forwarded_for: Option<&'a [u8]>,
    real_ip: Option<&'a [u8]>,
}

fuzz_target!(|input: AdmissionInput<'_>| {
    let _ = token_from_form(input.form_body);

    let guard = CsrfGuard::new(Duration::from_secs(60));
    // Nothing has been issued yet
    assert!(!guard.validate(input.token));
    let issued = guard.issue_token();
    assert!(guard.validate(&issued));

    let mut req = Request::new(Body::empty());
    for (name, raw) in [
        ("x-forwarded-for", input.forwarded_for),
        ("x-real-ip", input.real_ip),
    ] {
        if let Some(value) = raw.and_then(|raw| HeaderValue::from_bytes(raw).ok()) {
            req.headers_mut().insert(name, value);
        }
    }
    let key = client_key(&req);
    assert!(!key.is_empty());
    assert_eq!(key.trim(), key);
});

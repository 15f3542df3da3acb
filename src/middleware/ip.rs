//! Client identity extraction for rate limiting and request logging.
//!
//! # Key Precedence
//!
//! 1. `X-Forwarded-For` header value
//! 2. `X-Real-IP` header value
//! 3. The connection's peer address (axum `ConnectInfo<SocketAddr>`)
//! 4. [`UNKNOWN_CLIENT`] when none of the above is available
//!
//! Header values are used verbatim (trimmed, not split or parsed), so a
//! forwarded-for chain such as `"203.0.113.50, 10.0.0.1"` is one key. A
//! header that is blank after trimming counts as absent.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **These functions trust client-provided headers.** A client talking to the
//! service directly can pick its own key by setting `X-Forwarded-For` or
//! `X-Real-IP`, which lets it dodge per-client rate limits or exhaust another
//! client's quota. Deploy behind a reverse proxy that overwrites both headers:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! ## The "unknown" Fallback
//!
//! Requests without headers or connection info (typically in-process tests)
//! share the `"unknown"` key and are therefore limited collectively.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

/// Header consulted first for the client identity.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Header consulted when `X-Forwarded-For` is absent.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Fallback key when no client identity can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Where a client key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKeySource {
    /// `X-Forwarded-For` header.
    ForwardedFor,
    /// `X-Real-IP` header.
    RealIp,
    /// The TCP peer address.
    Connection,
    /// Nothing identified the client.
    Unknown,
}

/// Trimmed, non-empty header value; a blank header counts as absent.
#[inline]
fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the client key and where it came from.
pub fn client_key_with_source<B>(req: &Request<B>) -> (Cow<'static, str>, ClientKeySource) {
    if let Some(value) = header_str(req, FORWARDED_FOR_HEADER) {
        return (
            Cow::Owned(value.to_string()),
            ClientKeySource::ForwardedFor,
        );
    }

    if let Some(value) = header_str(req, REAL_IP_HEADER) {
        return (Cow::Owned(value.to_string()), ClientKeySource::RealIp);
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return (
            Cow::Owned(addr.ip().to_string()),
            ClientKeySource::Connection,
        );
    }

    (Cow::Borrowed(UNKNOWN_CLIENT), ClientKeySource::Unknown)
}

/// Resolve the rate-limit key for a request.
///
/// Returns `Cow<'static, str>`: borrowed for the "unknown" fallback, owned
/// otherwise. Use `.into_owned()` when the key must outlive the request.
#[inline]
pub fn client_key<B>(req: &Request<B>) -> Cow<'static, str> {
    client_key_with_source(req).0
}

/// Peer address of the connection, for logging.
///
/// Unlike [`client_key`] this ignores forwarding headers.
pub fn remote_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

//! Rate limit middleware for axum routers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, instrument, trace, warn};

use crate::config::ServerConfig;
use crate::ratelimit::RateLimiter;

/// Header carrying the client's API token (sent as `API_KEY`).
pub const API_KEY_HEADER: &str = "api_key";

/// Body returned with `429 Too Many Requests`.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body returned when the limiter could not reach a decision.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// State shared by every invocation of [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    trust_proxy_headers: bool,
    check_timeout: Duration,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, server: &ServerConfig) -> Self {
        Self {
            limiter,
            trust_proxy_headers: server.trust_proxy_headers,
            check_timeout: server.check_timeout(),
        }
    }
}

/// Reject requests whose client IP or API token is over its limit.
///
/// - limited: `429` with a fixed JSON error body
/// - storage failure or timeout: `500`, the request is not let through
/// - otherwise the request continues to the inner service
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request, state.trust_proxy_headers);
    let token = api_token(request.headers());

    let check = state.limiter.check_rate_limit(&ip, token.as_deref());
    match tokio::time::timeout(state.check_timeout, check).await {
        Ok(Ok(decision)) if decision.is_limited() => {
            warn!(ip = %ip, decision = ?decision, "Request rejected: rate limit exceeded");
            rate_limited_response()
        }
        Ok(Ok(_)) => {
            trace!(ip = %ip, "Request allowed");
            next.run(request).await
        }
        Ok(Err(e)) => {
            error!(ip = %ip, error = %e, "Rate limit check failed");
            internal_error_response()
        }
        Err(_) => {
            error!(
                ip = %ip,
                timeout = ?state.check_timeout,
                "Rate limit check timed out"
            );
            internal_error_response()
        }
    }
}

/// Best-effort client address of `request`.
///
/// With `trust_proxy_headers` the first `X-Forwarded-For` hop wins, then
/// `X-Real-IP`. Otherwise, or when neither is present, the socket peer is
/// used. An empty string means no address could be determined.
pub fn client_ip(request: &Request, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(ip) = forwarded_ip(request.headers()) {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded_for.or_else(real_ip).map(str::to_string)
}

/// The API token, if the header is present and readable.
fn api_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": RATE_LIMITED_MESSAGE })),
    )
        .into_response()
}

fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": INTERNAL_ERROR_MESSAGE })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(headers: &[(&str, &str)], peer: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/test");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(addr));
        }
        request
    }

    #[test]
    fn test_client_ip_from_peer() {
        let request = request_with(&[], Some("192.168.1.1:12345"));
        assert_eq!(client_ip(&request, true), "192.168.1.1");
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let request = request_with(
            &[
                ("X-Forwarded-For", "203.0.113.7, 10.0.0.1"),
                ("X-Real-IP", "198.51.100.2"),
            ],
            Some("10.0.0.1:443"),
        );
        assert_eq!(client_ip(&request, true), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip() {
        let request = request_with(&[("X-Real-IP", "198.51.100.2")], Some("10.0.0.1:443"));
        assert_eq!(client_ip(&request, true), "198.51.100.2");
    }

    #[test]
    fn test_client_ip_ignores_headers_when_untrusted() {
        let request = request_with(&[("X-Forwarded-For", "203.0.113.7")], Some("10.0.0.1:443"));
        assert_eq!(client_ip(&request, false), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_unknown() {
        let request = request_with(&[], None);
        assert_eq!(client_ip(&request, true), "");
    }

    #[test]
    fn test_api_token_header() {
        let request = request_with(&[("API_KEY", "abc123")], None);
        assert_eq!(api_token(request.headers()), Some("abc123".to_string()));

        let request = request_with(&[], None);
        assert_eq!(api_token(request.headers()), None);
    }
}

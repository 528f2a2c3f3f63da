//! HTTP surface: a rate limited router and the server that runs it.

mod middleware;
mod server;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::config::ServerConfig;
use crate::ratelimit::RateLimiter;

pub use middleware::{
    client_ip, rate_limit_middleware, RateLimitState, API_KEY_HEADER, INTERNAL_ERROR_MESSAGE,
    RATE_LIMITED_MESSAGE,
};
pub use server::HttpServer;

/// Build the application router with the rate limit middleware applied to
/// every route.
pub fn router(limiter: Arc<RateLimiter>, server: &ServerConfig) -> Router {
    let state = RateLimitState::new(limiter, server);

    Router::new()
        .route("/test", get(test_handler))
        .layer(axum::middleware::from_fn_with_state(
            state,
            rate_limit_middleware,
        ))
}

async fn test_handler() -> Json<Value> {
    Json(json!({ "message": "Rate limit test successful" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::ratelimit::LimiterConfig;
    use crate::storage::{FailingStorage, MemoryStorage, Storage};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn test_limits(ip_limit: u64, token_limit: u64) -> LimiterConfig {
        LimiterConfig {
            ip_limit,
            ip_block_duration_secs: 300,
            token_limit,
            token_block_duration_secs: 300,
        }
    }

    /// A store that never answers.
    struct StalledStorage;

    #[async_trait]
    impl Storage for StalledStorage {
        async fn increment(&self, _key: &str) -> Result<u64, StorageError> {
            std::future::pending().await
        }

        async fn set_expiration(&self, _key: &str, _duration_secs: u64) -> Result<(), StorageError> {
            std::future::pending().await
        }

        async fn get_counter(&self, _key: &str) -> Result<u64, StorageError> {
            std::future::pending().await
        }

        async fn is_blocked(&self, _key: &str) -> Result<bool, StorageError> {
            std::future::pending().await
        }
    }

    fn app_with(storage: Arc<dyn Storage>, limits: LimiterConfig) -> Router {
        app_with_server(storage, limits, &ServerConfig::default())
    }

    fn app_with_server(
        storage: Arc<dyn Storage>,
        limits: LimiterConfig,
        server: &ServerConfig,
    ) -> Router {
        let limiter = Arc::new(RateLimiter::new(storage, limits));
        router(limiter, server)
    }

    fn get_request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/test");
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        let peer: SocketAddr = "192.168.1.1:12345".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    async fn send(app: &Router, token: Option<&str>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(get_request(token)).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_allows_request() {
        let app = app_with(Arc::new(MemoryStorage::new()), test_limits(5, 10));

        let (status, body) = send(&app, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Rate limit test successful");
    }

    #[tokio::test]
    async fn test_blocks_request_over_ip_limit() {
        let app = app_with(Arc::new(MemoryStorage::new()), test_limits(1, 10));

        let (status, _) = send(&app, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], RATE_LIMITED_MESSAGE);
    }

    #[tokio::test]
    async fn test_token_has_its_own_limit() {
        let app = app_with(Arc::new(MemoryStorage::new()), test_limits(1, 2));

        assert_eq!(send(&app, Some("abc123")).await.0, StatusCode::OK);
        assert_eq!(send(&app, Some("abc123")).await.0, StatusCode::OK);
        assert_eq!(send(&app, Some("abc123")).await.0, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_blocked_ip_rejected_with_token() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_blocked("ip:192.168.1.1", true);
        let app = app_with(storage, test_limits(5, 10));

        let (status, _) = send(&app, Some("abc123")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_storage_failure_returns_internal_error() {
        let app = app_with(Arc::new(FailingStorage), test_limits(5, 10));

        let (status, body) = send(&app, None).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], INTERNAL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_stalled_storage_times_out_with_internal_error() {
        let server = ServerConfig {
            check_timeout_ms: 50,
            ..ServerConfig::default()
        };
        let app = app_with_server(Arc::new(StalledStorage), test_limits(5, 10), &server);

        let (status, body) = send(&app, None).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], INTERNAL_ERROR_MESSAGE);
    }
}

//! Core rate limiter implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::key::RateKey;
use crate::error::StorageError;
use crate::storage::Storage;

/// Thresholds applied by the limiter, fixed at construction.
///
/// Each block duration doubles as the length of the counting window for the
/// same identity, since the counter's TTL is set from it on the first request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per window for a client IP
    #[serde(default)]
    pub ip_limit: u64,
    /// Window and block length for a client IP, in seconds
    #[serde(default)]
    pub ip_block_duration_secs: u64,
    /// Requests allowed per window for an API token
    #[serde(default)]
    pub token_limit: u64,
    /// Window and block length for an API token, in seconds
    #[serde(default)]
    pub token_block_duration_secs: u64,
}

/// Limit and duration that apply to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    pub limit: u64,
    pub block_duration_secs: u64,
}

impl LimiterConfig {
    /// The rule for keys of the same kind as `key`.
    pub fn rule_for(&self, key: &RateKey) -> LimitRule {
        match key {
            RateKey::Ip(_) => LimitRule {
                limit: self.ip_limit,
                block_duration_secs: self.ip_block_duration_secs,
            },
            RateKey::Token(_) => LimitRule {
                limit: self.token_limit,
                block_duration_secs: self.token_block_duration_secs,
            },
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allowed,
    /// A live block marker already existed for this key
    Blocked(RateKey),
    /// This request pushed the key's count past its limit; the key is now blocked
    OverLimit { key: RateKey, count: u64 },
}

impl Decision {
    pub fn is_limited(&self) -> bool {
        !matches!(self, Decision::Allowed)
    }
}

/// Fixed-window rate limiter over a shared [`Storage`].
///
/// The limiter holds no state of its own between calls, so one instance can
/// serve any number of concurrent requests.
///
/// The check is not transactional. Between the block check and the increment
/// another request for the same key may cross the limit, so under heavy
/// concurrency a few requests past the limit can be allowed before the block
/// marker is visible. Increments themselves never lose updates.
pub struct RateLimiter {
    storage: Arc<dyn Storage>,
    config: LimiterConfig,
}

impl RateLimiter {
    /// Create a new rate limiter over `storage`.
    pub fn new(storage: Arc<dyn Storage>, config: LimiterConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Decide whether a request from `ip`, optionally carrying `token`, is limited.
    ///
    /// A blocked IP is rejected even when a valid token is supplied. With a
    /// non-empty token only the token is counted; otherwise the IP is.
    /// Storage errors are returned unchanged and no decision is made.
    pub async fn check_rate_limit(
        &self,
        ip: &str,
        token: Option<&str>,
    ) -> Result<Decision, StorageError> {
        let ip_key = RateKey::Ip(ip.to_string());
        if self.storage.is_blocked(&ip_key.to_string()).await? {
            debug!(key = %ip_key, "Request rejected: IP is blocked");
            return Ok(Decision::Blocked(ip_key));
        }

        let key = RateKey::classify(ip, token);
        if key.is_token() && self.storage.is_blocked(&key.to_string()).await? {
            debug!(key = %key, "Request rejected: token is blocked");
            return Ok(Decision::Blocked(key));
        }

        self.count(key).await
    }

    /// Count one request against `key` and block it once over the limit.
    async fn count(&self, key: RateKey) -> Result<Decision, StorageError> {
        let rule = self.config.rule_for(&key);
        let name = key.to_string();

        let count = self.storage.increment(&name).await?;
        trace!(key = %key, count, limit = rule.limit, "Counted request");

        // The first request of a window starts the window's lifetime.
        if count == 1 {
            self.storage
                .set_expiration(&name, rule.block_duration_secs)
                .await?;
        }

        if count > rule.limit {
            self.storage
                .set_expiration(&key.blocked_marker(), rule.block_duration_secs)
                .await?;
            debug!(
                key = %key,
                count,
                limit = rule.limit,
                block_duration_secs = rule.block_duration_secs,
                "Rate limit exceeded, key blocked"
            );
            return Ok(Decision::OverLimit { key, count });
        }

        Ok(Decision::Allowed)
    }
}

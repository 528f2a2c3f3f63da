//! Counter store abstraction and its implementations.
//!
//! The rate limiter only ever talks to a [`Storage`]. Two backends are provided:
//! [`MemoryStorage`] for tests and single-instance deployments, and
//! [`RedisStorage`] for counters shared between instances.

mod memory;
mod redis;

use async_trait::async_trait;

use crate::error::StorageError;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;

#[cfg(test)]
pub(crate) use self::memory::FailingStorage;

/// Suffix appended to a key to name its block marker.
pub const BLOCKED_SUFFIX: &str = ":blocked";

/// Name of the block marker entry for `key`.
pub fn blocked_key(key: &str) -> String {
    format!("{key}{BLOCKED_SUFFIX}")
}

/// Capability contract of a counter store.
///
/// Implementations are shared by every in-flight request, so all operations take
/// `&self` and must be safe under concurrent use. Dropping a returned future
/// abandons the call; callers bound latency with `tokio::time::timeout`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically add one to the counter at `key`, creating it at 1 if absent,
    /// and return the new value.
    ///
    /// Concurrent increments of the same key must observe distinct,
    /// sequential values.
    async fn increment(&self, key: &str) -> Result<u64, StorageError>;

    /// Give the entry at `key` a time-to-live of `duration_secs`.
    ///
    /// An existing entry keeps its value. An absent entry is created as a
    /// presence marker, which is how block markers come into existence. A
    /// duration of zero removes the entry.
    async fn set_expiration(&self, key: &str, duration_secs: u64) -> Result<(), StorageError>;

    /// Current value of the counter at `key`, or 0 if it is absent or expired.
    async fn get_counter(&self, key: &str) -> Result<u64, StorageError>;

    /// Whether a live block marker (`<key>:blocked`) exists for `key`.
    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError>;
}

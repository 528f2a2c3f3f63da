//! Error types for the Ratekeeper service.

use std::time::Duration;

use thiserror::Error;

/// Failure talking to the counter store.
///
/// This is the only failure the rate limiter itself can produce. Absence of a
/// counter or block marker is never an error; it reads as `0` / `false`.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connectivity loss or a protocol-level failure reported by the backend
    #[error("storage backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A storage call did not complete within its deadline
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend replied with something that could not be interpreted
    #[error("malformed storage response: {0}")]
    Malformed(String),
}

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;

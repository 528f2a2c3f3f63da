//! Redis-backed counter store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult};
use tracing::{debug, info};

use super::{blocked_key, Storage};
use crate::config::RedisConfig;
use crate::error::StorageError;

/// [`Storage`] backed by a shared Redis instance.
///
/// Keys are stored as plain strings (`ip:<addr>`, `token:<value>` and their
/// `:blocked` variants) holding integers, and expiry uses Redis' native TTLs.
/// The underlying [`ConnectionManager`] multiplexes one reconnecting
/// connection; cloning it per command is cheap.
#[derive(Clone)]
pub struct RedisStorage {
    manager: ConnectionManager,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStorage {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let command_timeout = config.command_timeout();
        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connecting to Redis"
        );

        let client = redis::Client::open(config.url())?;
        let manager = with_deadline(command_timeout, ConnectionManager::new(client)).await?;
        let storage = Self {
            manager,
            command_timeout,
        };

        let mut conn = storage.manager.clone();
        let pong: String = storage
            .run(redis::cmd("PING").query_async(&mut conn))
            .await?;
        debug!(reply = %pong, "Redis connection verified");

        Ok(storage)
    }

    async fn run<T, F>(&self, command: F) -> Result<T, StorageError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        with_deadline(self.command_timeout, command).await
    }
}

async fn with_deadline<T, F>(deadline: Duration, command: F) -> Result<T, StorageError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(deadline, command).await {
        Ok(result) => result.map_err(classify),
        Err(_) => Err(StorageError::Timeout(deadline)),
    }
}

/// Replies that failed to convert are a malformed response, not lost connectivity.
fn classify(err: RedisError) -> StorageError {
    if err.kind() == ErrorKind::TypeError {
        StorageError::Malformed(err.to_string())
    } else {
        StorageError::Backend(err)
    }
}

/// `MULTI; SET key 1 EX d NX; EXPIRE key d; EXEC`.
///
/// SET NX materialises a missing marker; EXPIRE then applies to either case.
fn expiration_pipeline(key: &str, duration_secs: u64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(key)
        .arg(1u64)
        .arg("EX")
        .arg(duration_secs)
        .arg("NX")
        .ignore()
        .cmd("EXPIRE")
        .arg(key)
        .arg(duration_secs)
        .ignore();
    pipe
}

#[async_trait]
impl Storage for RedisStorage {
    async fn increment(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.manager.clone();
        self.run(conn.incr::<_, _, u64>(key, 1u64)).await
    }

    async fn set_expiration(&self, key: &str, duration_secs: u64) -> Result<(), StorageError> {
        let mut conn = self.manager.clone();

        // EX 0 is rejected by Redis, and a zero TTL means the entry is gone anyway.
        if duration_secs == 0 {
            return self.run(conn.del::<_, ()>(key)).await;
        }

        let pipe = expiration_pipeline(key, duration_secs);
        self.run(pipe.query_async(&mut conn)).await
    }

    async fn get_counter(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.manager.clone();
        let value: Option<u64> = self.run(conn.get(key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.manager.clone();
        self.run(conn.exists::<_, bool>(blocked_key(key))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn unreachable_config() -> RedisConfig {
        RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            command_timeout_ms: 200,
            ..RedisConfig::default()
        }
    }

    #[test]
    fn test_classify_type_error_as_malformed() {
        let err = RedisError::from((ErrorKind::TypeError, "not an integer"));
        assert!(matches!(classify(err), StorageError::Malformed(_)));

        let err = RedisError::from((ErrorKind::IoError, "connection reset"));
        assert!(matches!(classify(err), StorageError::Backend(_)));
    }

    #[test]
    fn test_expiration_pipeline_commands() {
        let packed = expiration_pipeline("token:abc:blocked", 30).get_packed_pipeline();
        let packed = String::from_utf8(packed).unwrap();

        let set = "*6\r\n$3\r\nSET\r\n$17\r\ntoken:abc:blocked\r\n$1\r\n1\r\n\
                   $2\r\nEX\r\n$2\r\n30\r\n$2\r\nNX\r\n";
        let expire = "*3\r\n$6\r\nEXPIRE\r\n$17\r\ntoken:abc:blocked\r\n$2\r\n30\r\n";

        let multi_at = packed.find("MULTI").expect("pipeline is a transaction");
        let set_at = packed.find(set).expect("SET NX EX present");
        let expire_at = packed.find(expire).expect("EXPIRE present");
        let exec_at = packed.find("EXEC").expect("transaction is executed");
        assert!(multi_at < set_at && set_at < expire_at && expire_at < exec_at);
    }

    #[tokio::test]
    async fn test_connect_without_redis_fails() {
        let result = RedisStorage::connect(&unreachable_config()).await;
        assert_err!(result);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let result: Result<(), StorageError> =
            with_deadline(Duration::from_millis(10), std::future::pending::<RedisResult<()>>()).await;
        assert!(matches!(result, Err(StorageError::Timeout(d)) if d == Duration::from_millis(10)));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server on localhost:6379"]
    async fn test_live_counter_and_marker() {
        let storage = RedisStorage::connect(&RedisConfig::default()).await.unwrap();
        let key = "ratekeeper-test:ip:127.0.0.1";
        let marker = blocked_key(key);
        let mut conn = storage.manager.clone();
        let _: () = conn.del(&[key, marker.as_str()]).await.unwrap();

        assert_eq!(storage.get_counter(key).await.unwrap(), 0);
        assert_eq!(storage.increment(key).await.unwrap(), 1);
        assert_eq!(storage.increment(key).await.unwrap(), 2);
        storage.set_expiration(key, 30).await.unwrap();
        assert_eq!(storage.get_counter(key).await.unwrap(), 2);

        assert!(!storage.is_blocked(key).await.unwrap());
        storage.set_expiration(&marker, 30).await.unwrap();
        assert!(storage.is_blocked(key).await.unwrap());

        storage.set_expiration(&marker, 0).await.unwrap();
        assert!(!storage.is_blocked(key).await.unwrap());
        let _: () = conn.del(key).await.unwrap();
    }
}

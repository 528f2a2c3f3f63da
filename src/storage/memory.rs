//! In-process counter store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use super::{blocked_key, Storage};
use crate::error::StorageError;

/// Writes between sweeps of expired entries.
const PURGE_INTERVAL: u64 = 256;

/// A stored value and its optional deadline.
#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// In-memory [`Storage`] backend.
///
/// Counters and block markers share one keyspace, the same way they do in
/// Redis, and the whole arena sits behind a single reader/writer lock. Reads
/// (`get_counter`, `is_blocked`) run concurrently with each other; every
/// mutation takes the write lock.
///
/// Expiry is measured on the tokio clock, so tests can pause and advance time
/// instead of sleeping. Expired entries read as absent; writers sweep them
/// out every [`PURGE_INTERVAL`] writes, so keys that are never seen again do
/// not accumulate.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place or remove a block marker for `key` directly, with no TTL.
    pub fn set_blocked(&self, key: &str, blocked: bool) {
        let marker = blocked_key(key);
        let mut entries = self.entries.write();
        if blocked {
            entries.insert(
                marker,
                Entry {
                    value: 1,
                    expires_at: None,
                },
            );
        } else {
            entries.remove(&marker);
        }
    }

    /// Remaining time-to-live of a live entry.
    ///
    /// Returns `None` when the entry is absent, expired, or has no TTL.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Whether a live entry exists at `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Make the entry at `key` expire immediately, as if its TTL had elapsed.
    pub fn expire_now(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        purge(&mut entries, now)
    }

    /// Sweep expired entries once every [`PURGE_INTERVAL`] writes.
    fn note_write(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_INTERVAL == 0 {
            let removed = purge(entries, now);
            trace!(removed, remaining = entries.len(), "Purged expired entries");
        }
    }

    /// Entries held in the map, expired or not.
    #[cfg(test)]
    fn stored_len(&self) -> usize {
        self.entries.read().len()
    }

    /// Clear all counters, block markers and expirations at once.
    ///
    /// This is primarily useful for testing.
    pub fn reset(&self) {
        self.entries.write().clear();
    }
}

fn purge(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    before - entries.len()
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn increment(&self, key: &str) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.write();

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: None,
            };
        }
        entry.value += 1;
        let count = entry.value;

        self.note_write(&mut entries, now);
        trace!(key = %key, count, "Incremented counter");
        Ok(count)
    }

    async fn set_expiration(&self, key: &str, duration_secs: u64) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.write();

        if duration_secs == 0 {
            entries.remove(key);
            self.note_write(&mut entries, now);
            return Ok(());
        }

        let deadline = now + Duration::from_secs(duration_secs);
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => entry.expires_at = Some(deadline),
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: Some(deadline),
                    },
                );
            }
        }

        self.note_write(&mut entries, now);
        trace!(key = %key, duration_secs, "Set expiration");
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<u64, StorageError> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.value))
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.contains(&blocked_key(key)))
    }
}

/// A store whose every call fails, for exercising error propagation.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingStorage;

#[cfg(test)]
#[async_trait]
impl Storage for FailingStorage {
    async fn increment(&self, _key: &str) -> Result<u64, StorageError> {
        Err(StorageError::Malformed("storage unavailable".to_string()))
    }

    async fn set_expiration(&self, _key: &str, _duration_secs: u64) -> Result<(), StorageError> {
        Err(StorageError::Malformed("storage unavailable".to_string()))
    }

    async fn get_counter(&self, _key: &str) -> Result<u64, StorageError> {
        Err(StorageError::Malformed("storage unavailable".to_string()))
    }

    async fn is_blocked(&self, _key: &str) -> Result<bool, StorageError> {
        Err(StorageError::Malformed("storage unavailable".to_string()))
    }
}

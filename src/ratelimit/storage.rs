//! Distributed storage port.
//!
//! A [`StorageBackend`] lets several limiter instances share per-key state.
//! The limiter itself only uses `get` and `set`; the counter operations are
//! part of the contract so that backends can offer atomic primitives to
//! callers that need them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors a storage backend may report.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("value for '{key}' is not an integer")]
    NotAnInteger { key: String },
    #[error("counter '{key}' would overflow")]
    Overflow { key: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value store with optional per-key TTL.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, expiring after `ttl_secs` when given.
    async fn set(
        &self,
        key: &str,
        value: String,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Add `by` to the integer at `key` (missing counts as 0) and return it.
    async fn increment(
        &self,
        key: &str,
        by: i64,
        ttl_secs: Option<u64>,
    ) -> Result<i64, StorageError>;

    /// Subtract `by` from the integer at `key` and return it.
    async fn decrement(
        &self,
        key: &str,
        by: i64,
        ttl_secs: Option<u64>,
    ) -> Result<i64, StorageError> {
        let by = by.checked_neg().ok_or_else(|| StorageError::Overflow {
            key: key.to_string(),
        })?;
        self.increment(key, by, ttl_secs).await
    }

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl_secs: Option<u64>) -> Self {
        Self {
            value,
            expires_at: ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Writes between sweeps of expired entries.
const PURGE_EVERY_WRITES: u64 = 1024;

/// An in-process [`StorageBackend`].
///
/// Useful for sharing state between limiter instances in one process and
/// as a reference implementation of the port. Expired entries are dropped
/// when read and swept every [`PURGE_EVERY_WRITES`] writes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, StoredValue>,
    writes: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired());
        before.saturating_sub(self.entries.len())
    }

    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| v.is_expired());
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl_secs));
        self.note_write();
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        by: i64,
        ttl_secs: Option<u64>,
    ) -> Result<i64, StorageError> {
        let next = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| StoredValue::new("0".to_string(), ttl_secs));

            let current = if entry.is_expired() {
                0
            } else {
                entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| StorageError::NotAnInteger {
                        key: key.to_string(),
                    })?
            };

            let next = current.checked_add(by).ok_or_else(|| StorageError::Overflow {
                key: key.to_string(),
            })?;
            *entry = StoredValue::new(next.to_string(), ttl_secs);
            next
        };
        self.note_write();
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("a").await.unwrap(), None);

        storage.set("a", "hello".to_string(), None).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap().as_deref(), Some("hello"));
        assert_eq!(storage.len(), 1);

        storage.delete("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let storage = MemoryStorage::new();

        assert_eq!(storage.increment("n", 1, None).await.unwrap(), 1);
        assert_eq!(storage.increment("n", 4, None).await.unwrap(), 5);
        assert_eq!(storage.decrement("n", 2, None).await.unwrap(), 3);
        assert_eq!(storage.get("n").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_increment_non_integer_fails() {
        let storage = MemoryStorage::new();
        storage.set("s", "abc".to_string(), None).await.unwrap();

        let err = storage.increment("s", 1, None).await.unwrap_err();
        assert!(matches!(err, StorageError::NotAnInteger { .. }));
    }

    #[tokio::test]
    async fn test_increment_overflow_fails() {
        let storage = MemoryStorage::new();
        storage.set("n", i64::MAX.to_string(), None).await.unwrap();

        let err = storage.increment("n", 1, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Overflow { .. }));
        // the stored value is left as it was
        assert_eq!(
            storage.get("n").await.unwrap(),
            Some(i64::MAX.to_string())
        );
        assert!(storage.decrement("n", i64::MIN, None).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged_without_reads() {
        let storage = MemoryStorage::new();
        for i in 0..10 {
            storage
                .set(&format!("stale-{}", i), "v".to_string(), Some(0))
                .await
                .unwrap();
        }
        storage.set("live", "v".to_string(), None).await.unwrap();
        assert_eq!(storage.entries.len(), 11);

        assert_eq!(storage.purge_expired(), 10);
        assert_eq!(storage.entries.len(), 1);

        // the write that completes a purge interval sweeps on its own
        let until_purge = PURGE_EVERY_WRITES - storage.writes.load(Ordering::Relaxed);
        for i in 0..until_purge {
            storage
                .set(&format!("stale-{}", i % 10), "v".to_string(), Some(0))
                .await
                .unwrap();
        }
        assert_eq!(storage.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let storage = MemoryStorage::new();
        storage.set("t", "v".to_string(), Some(0)).await.unwrap();
        assert_eq!(storage.get("t").await.unwrap(), None);

        // an expired counter restarts from zero
        storage.set("c", "41".to_string(), Some(0)).await.unwrap();
        assert_eq!(storage.increment("c", 1, None).await.unwrap(), 1);
    }
}

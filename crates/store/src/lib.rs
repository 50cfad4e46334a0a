//! Shared key-value store boundary for guard state.
//!
//! Bucket state and similar short-lived records live behind the [`KvStore`]
//! trait so deployments can swap the in-process backend for a networked one
//! without touching the admission logic. Every entry carries a TTL; an
//! unreachable backend is reported as [`StoreError::Unavailable`], which is
//! distinct from a key simply being absent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from store backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("STORE UNREACHABLE: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Key-value backend with per-key expiry.
///
/// `compare_and_swap` is the atomic read-modify-write primitive: the write
/// lands only if the stored value still equals `expected` (`None` meaning
/// the key is absent). Callers loop on a `false` return.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with a time-to-live.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Store `value` only if the current value equals `expected`.
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Cheap liveness check against the backend.
    async fn ping(&self) -> Result<()>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process [`KvStore`] backend.
///
/// Entries expire lazily on read and can be swept eagerly. The single lock
/// makes `compare_and_swap` trivially atomic, which is exactly what the
/// admission controller needs when the store is process-local.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop expired entries eagerly. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.live(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired store entries", removed);
        }
        removed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let current = entries.get(key).filter(|e| e.live(now)).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(entry) => Ok(entry.live(now)),
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Basic Operations Tests ==========

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        store
            .set_ex("alpha", "1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let value = store.get("alpha").await.unwrap();
        assert_eq!(value, Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_existing_key() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "old".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_ex("k", "new".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some("new".to_string()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ping() {
        let store = MemoryStore::new();
        assert!(store.ping().await.is_ok());
    }

    // ========== Expiry Tests ==========

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .set_ex("short", "v".to_string(), Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(store.get("short").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let store = MemoryStore::new();
        store
            .set_ex("a", "1".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .set_ex("b", "2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = store.sweep().await;

        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("b").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_ttl_refreshes_on_set() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v1".to_string(), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .set_ex("k", "v2".to_string(), Duration::from_millis(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Would be expired under the original TTL
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
    }

    // ========== Compare-and-Swap Tests ==========

    #[tokio::test]
    async fn test_cas_on_absent_key() {
        let store = MemoryStore::new();

        let swapped = store
            .compare_and_swap("k", None, "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(swapped);
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_cas_matching_value() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let swapped = store
            .compare_and_swap("k", Some("v1"), "v2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(swapped);
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_cas_stale_expectation_fails() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "current".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let swapped = store
            .compare_and_swap("k", Some("stale"), "v2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!swapped);
        assert_eq!(store.get("k").await.unwrap(), Some("current".to_string()));

        let swapped = store
            .compare_and_swap("k", None, "v2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!swapped);
    }

    #[tokio::test]
    async fn test_cas_treats_expired_as_absent() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "old".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let swapped = store
            .compare_and_swap("k", None, "fresh".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(swapped);
        assert_eq!(store.get("k").await.unwrap(), Some("fresh".to_string()));
    }

    #[tokio::test]
    async fn test_cas_under_contention_single_winner() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        store
            .set_ex("k", "0".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap("k", Some("0"), format!("{}", i + 1), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}

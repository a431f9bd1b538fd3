//! Cache/Lock client
//!
//! [`CacheStore`] is the key-value substrate (TTL, atomic set-if-absent,
//! pattern scan, list append). [`CacheClient`] builds the JSON cache,
//! payload compression and the stampede-safe `get_or_compute` on top of it.
//!
//! ```text
//! SessionCoordinator ─► CacheClient ─► Arc<dyn CacheStore>
//!                                         ├── MemoryStore (in-process)
//!                                         └── RedisStore  (feature "redis")
//! ```

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::future::Future;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{CACHE_COMPUTES, CACHE_LOOKUPS};

pub use memory::MemoryStore;

/// Sentinel stored in lock keys
pub const LOCK_SENTINEL: &str = "1";

/// Suffix of the companion lock used by `get_or_compute`
const COMPUTE_LOCK_SUFFIX: &str = ":lock";

/// Suffix of the marker key set next to compressed payloads
const COMPRESSED_SUFFIX: &str = ":compressed";

/// Error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("wrong value type stored at {0}")]
    WrongType(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("payload decode error: {0}")]
    Decode(String),
}

/// Key-value substrate consumed by the coordination layer
///
/// Implementations must make `set_nx` atomic: of any number of concurrent
/// callers for the same absent key, exactly one observes `true`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `SET key value [EX ttl]`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// `SET key value NX EX ttl`, true iff the key was written
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// `DEL key...`, returns the number of keys removed
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Keys matching a glob pattern (`*`, `?`)
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// `RPUSH key value`, returns the new list length
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, CacheError>;

    /// `LRANGE key start stop` with redis index semantics
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

/// Cache client with JSON, compression and memoization helpers
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
    compression_threshold: usize,
    compute_lock_ttl: Duration,
    compute_poll_interval: Duration,
}

impl CacheClient {
    /// Create a client over a substrate
    ///
    /// # Arguments
    /// * `store` - The key-value substrate
    /// * `default_ttl` - TTL used when a write does not pass one
    /// * `compression_threshold` - JSON payloads larger than this are compressed
    pub fn new(store: Arc<dyn CacheStore>, default_ttl: Duration, compression_threshold: usize) -> Self {
        Self {
            store,
            default_ttl,
            compression_threshold,
            compute_lock_ttl: Duration::from_secs(30),
            compute_poll_interval: Duration::from_millis(100),
        }
    }

    /// Client over a fresh in-process store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600), 16 * 1024)
    }

    /// Override the companion lock TTL and the non-claimant poll interval
    pub fn with_compute_timing(mut self, lock_ttl: Duration, poll_interval: Duration) -> Self {
        self.compute_lock_ttl = lock_ttl;
        self.compute_poll_interval = poll_interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Raw string read; substrate errors are reported as a miss
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Cache get failed");
                None
            }
        }
    }

    /// Raw string write with the default TTL when `ttl` is `None`
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        match self.store.set(key, value, Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache set failed");
                false
            }
        }
    }

    /// Atomic set-if-absent; errors propagate so callers can tell busy from down
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.store.set_nx(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store.delete(&[key.to_string()]).await? > 0)
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key, error = %e, "Cache exists failed");
                false
            }
        }
    }

    /// Read a JSON value, decompressing when the `key:compressed` marker is present
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get_json(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Cache JSON get failed");
                None
            }
        }
    }

    async fn try_get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.store.get(key).await? else {
            CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
            return Ok(None);
        };
        CACHE_LOOKUPS.with_label_values(&["hit"]).inc();

        let compressed = self.store.exists(&compressed_marker(key)).await?;
        let text = if compressed { decompress(&raw)? } else { raw };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write a JSON value; large payloads are compressed and tagged
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match self.try_set_json(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache JSON set failed");
                false
            }
        }
    }

    async fn try_set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let text = serde_json::to_string(value)?;
        let marker = compressed_marker(key);

        if text.len() > self.compression_threshold {
            let packed = compress(&text)?;
            debug!(key, raw = text.len(), packed = packed.len(), "Compressed cache payload");
            self.store.set(key, &packed, Some(ttl)).await?;
            self.store.set(&marker, LOCK_SENTINEL, Some(ttl)).await?;
        } else {
            self.store.set(key, &text, Some(ttl)).await?;
            self.store.delete(&[marker]).await?;
        }
        Ok(())
    }

    /// Delete every key matching a glob pattern, returns the number removed
    pub async fn clear_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let keys = self.store.scan(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(&keys).await?;
        debug!(pattern, removed, "Cleared cache keys");
        Ok(removed)
    }

    /// Memoized computation with stampede protection
    ///
    /// On a miss, callers race for `{key}:lock`. The claimant re-checks the
    /// cache, runs `factory`, writes the result and releases the companion
    /// lock. Everyone else sleeps for the poll interval and starts over, so
    /// concurrent callers for one uncached key invoke `factory` once.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &str, ttl: Option<Duration>, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lock_key = format!("{}{}", key, COMPUTE_LOCK_SUFFIX);

        loop {
            if let Some(hit) = self.get_json::<T>(key).await {
                return Ok(hit);
            }

            if !self.store.set_nx(&lock_key, LOCK_SENTINEL, self.compute_lock_ttl).await? {
                tokio::time::sleep(self.compute_poll_interval).await;
                continue;
            }

            let guard = ComputeLockGuard::new(self.store.clone(), lock_key.clone());

            if let Some(hit) = self.get_json::<T>(key).await {
                guard.release().await;
                return Ok(hit);
            }

            CACHE_COMPUTES.inc();
            let result = factory().await;
            if let Ok(value) = &result {
                self.set_json(key, value, ttl).await;
            }
            guard.release().await;
            return result;
        }
    }
}

/// Releases the companion lock on every exit path
///
/// `release` deletes it inline. If the owning future is dropped first, the
/// delete is spawned onto the runtime instead.
struct ComputeLockGuard {
    store: Arc<dyn CacheStore>,
    key: String,
    armed: bool,
}

impl ComputeLockGuard {
    fn new(store: Arc<dyn CacheStore>, key: String) -> Self {
        Self { store, key, armed: true }
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.store.delete(&[self.key.clone()]).await {
            warn!(key = %self.key, error = %e, "Failed to release compute lock");
        }
    }
}

impl Drop for ComputeLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.delete(&[key]).await;
            });
        }
    }
}

fn compressed_marker(key: &str) -> String {
    format!("{}{}", key, COMPRESSED_SUFFIX)
}

fn compress(text: &str) -> Result<String, CacheError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| CacheError::Decode(e.to_string()))?;
    let bytes = encoder.finish().map_err(|e| CacheError::Decode(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn decompress(packed: &str) -> Result<String, CacheError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(packed)
        .map_err(|e| CacheError::Decode(e.to_string()))?;
    let mut text = String::new();
    ZlibDecoder::new(bytes.as_slice())
        .read_to_string(&mut text)
        .map_err(|e| CacheError::Decode(e.to_string()))?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_json_roundtrip_small_payload_is_plain() {
        let cache = CacheClient::in_memory();
        assert!(cache.set_json("k", &vec![1, 2, 3], None).await);

        assert_eq!(cache.get("k").await.as_deref(), Some("[1,2,3]"));
        assert!(!cache.exists("k:compressed").await);
        assert_eq!(cache.get_json::<Vec<i32>>("k").await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_large_payload_is_compressed_and_tagged() {
        let cache = CacheClient::new(Arc::new(MemoryStore::new()), Duration::from_secs(60), 64);
        let big: Vec<String> = (0..200).map(|i| format!("row-{i}")).collect();

        assert!(cache.set_json("big", &big, None).await);
        assert!(cache.exists("big:compressed").await);
        let raw = cache.get("big").await.unwrap();
        assert!(!raw.starts_with('['));
        assert_eq!(cache.get_json::<Vec<String>>("big").await, Some(big));

        // Overwriting with a small payload drops the marker
        assert!(cache.set_json("big", &vec!["x"], None).await);
        assert!(!cache.exists("big:compressed").await);
        assert_eq!(cache.get_json::<Vec<String>>("big").await, Some(vec!["x".to_string()]));
    }

    #[tokio::test]
    async fn test_clear_pattern() {
        let cache = CacheClient::in_memory();
        cache.set("query:a", "1", None).await;
        cache.set("query:b", "2", None).await;
        cache.set("other", "3", None).await;

        assert_eq!(cache.clear_pattern("query:*").await.unwrap(), 2);
        assert!(!cache.exists("query:a").await);
        assert!(cache.exists("other").await);
        assert_eq!(cache.clear_pattern("nothing:*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_or_compute_memoizes() {
        let cache = CacheClient::in_memory();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u32 = cache
                .get_or_compute::<_, CacheError, _, _>("answer", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.exists("answer:lock").await);
    }

    #[tokio::test]
    async fn test_get_or_compute_failure_is_not_cached() {
        let cache = CacheClient::in_memory();

        let first: Result<u32, CacheError> = cache
            .get_or_compute("flaky", None, || async { Err(CacheError::Backend("boom".into())) })
            .await;
        assert!(first.is_err());
        assert!(!cache.exists("flaky:lock").await);

        let second: Result<u32, CacheError> =
            cache.get_or_compute("flaky", None, || async { Ok(7) }).await;
        assert_eq!(second.unwrap(), 7);
    }
}

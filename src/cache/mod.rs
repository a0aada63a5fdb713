//! Namespaced cache with per-entry TTL that fails open.
//!
//! [`KeyedCache`] wraps a [`CacheBackend`] (Redis in production, an in-memory
//! map in tests). Every backend call carries an I/O timeout; the first timeout
//! or backend error disables the cache for the rest of the process, after
//! which reads miss and writes are no-ops. The pipeline keeps working, only
//! without caching.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vulnflow::cache::{KeyedCache, MemoryCacheBackend};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let cache = KeyedCache::new(Arc::new(MemoryCacheBackend::new()), Duration::from_millis(500));
//! cache.set("epss", "npm:lodash:latest", &0.42_f64, Duration::from_secs(60)).await;
//!
//! let score: Option<f64> = cache.get("epss", "npm:lodash:latest").await;
//! assert_eq!(score, Some(0.42));
//! # }
//! ```

mod memory;
mod redis_backend;

pub use self::memory::MemoryCacheBackend;
pub use self::redis_backend::RedisCacheBackend;

use crate::error::CacheError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// `GET key` / `SET key value EX ttl` over some storage.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
}

pub struct KeyedCache {
    backend: Option<Arc<dyn CacheBackend>>,
    io_timeout: Duration,
    disabled: AtomicBool,
}

impl KeyedCache {
    pub fn new(backend: Arc<dyn CacheBackend>, io_timeout: Duration) -> Self {
        Self {
            backend: Some(backend),
            io_timeout,
            disabled: AtomicBool::new(false),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            io_timeout: Duration::ZERO,
            disabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some() && !self.disabled.load(Ordering::Acquire)
    }

    fn entry_key(namespace: &str, key: &str) -> String {
        format!("{}:{}", namespace, key)
    }

    fn backend(&self) -> Option<&Arc<dyn CacheBackend>> {
        if self.disabled.load(Ordering::Acquire) {
            return None;
        }
        self.backend.as_ref()
    }

    fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            warn!(reason, "cache backend unavailable, caching disabled for this process");
        }
    }

    /// Reads and decodes an entry. Undecodable entries are treated as misses.
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let backend = self.backend()?;
        let entry_key = Self::entry_key(namespace, key);

        let raw = match tokio::time::timeout(self.io_timeout, backend.get(&entry_key)).await {
            Ok(Ok(raw)) => raw?,
            Ok(Err(e)) => {
                self.disable(&e.to_string());
                return None;
            }
            Err(_) => {
                self.disable("read timed out");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key = %entry_key, error = %e, "ignoring undecodable cache entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) {
        let Some(backend) = self.backend() else {
            return;
        };
        let entry_key = Self::entry_key(namespace, key);

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %entry_key, error = %e, "value is not serializable, not caching");
                return;
            }
        };

        match tokio::time::timeout(self.io_timeout, backend.set(&entry_key, raw, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.disable(&e.to_string()),
            Err(_) => self.disable("write timed out"),
        }
    }
}

impl std::fmt::Debug for KeyedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCache")
            .field("enabled", &self.is_enabled())
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct FailingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Backend("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Backend("connection refused".into()))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl CacheBackend for SlowBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn memory_cache() -> KeyedCache {
        KeyedCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = memory_cache();
        cache
            .set("mapping", "npm:a:latest", &vec!["CVE-2024-1"], Duration::from_secs(60))
            .await;

        let ids: Option<Vec<String>> = cache.get("mapping", "npm:a:latest").await;
        assert_eq!(ids, Some(vec!["CVE-2024-1".to_string()]));

        let other: Option<Vec<String>> = cache.get("epss", "npm:a:latest").await;
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_backend_error_disables_cache() {
        let backend = Arc::new(FailingBackend {
            calls: AtomicUsize::new(0),
        });
        let cache = KeyedCache::new(backend.clone(), Duration::from_millis(500));

        let value: Option<String> = cache.get("ns", "k").await;
        assert!(value.is_none());
        assert!(!cache.is_enabled());

        cache.set("ns", "k", &"v", Duration::from_secs(1)).await;
        let _: Option<String> = cache.get("ns", "k").await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let cache = KeyedCache::new(Arc::new(SlowBackend), Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        let value: Option<String> = cache.get("ns", "k").await;
        assert!(value.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn test_unserializable_value_is_skipped() {
        let cache = memory_cache();
        let mut bad = HashMap::new();
        bad.insert((1_u8, 2_u8), 3_u8);

        cache.set("ns", "bad", &bad, Duration::from_secs(60)).await;
        assert!(cache.is_enabled());

        let value: Option<serde_json::Value> = cache.get("ns", "bad").await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_silent() {
        let cache = KeyedCache::disabled();
        cache.set("ns", "k", &1_u32, Duration::from_secs(60)).await;
        let value: Option<u32> = cache.get("ns", "k").await;
        assert!(value.is_none());
        assert!(!cache.is_enabled());
    }
}

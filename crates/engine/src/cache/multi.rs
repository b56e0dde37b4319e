use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlflow_core::CacheConfig;
use tracing::{debug, warn};

use super::fingerprint::Fingerprint;
use super::l1::{L1Cache, L1Stats};
use super::shared::{build_shared_cache, SharedCache};
use crate::error::CacheError;

/// Which level served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    L1,
    L2,
}

/// Result of a lookup. `errors` counts L2 failures that were downgraded to a miss.
#[derive(Debug, Clone, Default)]
pub struct CacheLookup {
    pub value: Option<Value>,
    pub level: Option<CacheLevel>,
    pub errors: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub l1: L1Stats,
    pub l2_backend: Option<String>,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_errors: u64,
}

/// Read-through, write-through combination of the in-process L1 and an
/// optional shared L2.
///
/// The shared level is best effort: any error from it is logged, counted and
/// treated as a miss, so a broken backend degrades the run to L1 only.
pub struct MultiLevelCache {
    l1: L1Cache,
    shared: Option<Arc<dyn SharedCache>>,
    ttl: Duration,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
}

impl MultiLevelCache {
    pub fn new(l1: L1Cache, shared: Option<Arc<dyn SharedCache>>, ttl: Duration) -> Self {
        Self {
            l1,
            shared,
            ttl,
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
            l2_errors: AtomicU64::new(0),
        }
    }

    /// Build from `[cache]` config. A shared level that cannot be opened is
    /// reported as an error so misconfiguration surfaces at startup.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let l1 = L1Cache::new(config.l1_capacity, config.l1_shards);
        let (shared, ttl) = match &config.shared {
            Some(shared) => (Some(build_shared_cache(shared)?), shared.ttl()),
            None => (None, Duration::from_secs(3600)),
        };
        Ok(Self::new(l1, shared, ttl))
    }

    pub fn l1(&self) -> &L1Cache {
        &self.l1
    }

    pub async fn get(&self, fp: &Fingerprint) -> CacheLookup {
        if let Some(value) = self.l1.get(fp) {
            return CacheLookup {
                value: Some(value),
                level: Some(CacheLevel::L1),
                errors: 0,
            };
        }
        let Some(shared) = &self.shared else {
            return CacheLookup::default();
        };
        match shared.get(fp).await {
            Ok(Some(value)) => {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fp, "promoting shared cache hit to L1");
                self.l1.put(fp.clone(), value.clone());
                CacheLookup {
                    value: Some(value),
                    level: Some(CacheLevel::L2),
                    errors: 0,
                }
            }
            Ok(None) => {
                self.l2_misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::default()
            }
            Err(e) => {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = shared.name(), fingerprint = %fp, error = %e, "shared cache read failed, treating as miss");
                CacheLookup {
                    errors: 1,
                    ..CacheLookup::default()
                }
            }
        }
    }

    /// Store in both levels. Returns the number of L2 errors (0 or 1).
    pub async fn put(&self, fp: &Fingerprint, value: &Value) -> u32 {
        self.l1.put(fp.clone(), value.clone());
        let Some(shared) = &self.shared else {
            return 0;
        };
        match shared.put(fp, value, self.ttl).await {
            Ok(()) => 0,
            Err(e) => {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = shared.name(), fingerprint = %fp, error = %e, "shared cache write failed");
                1
            }
        }
    }

    pub async fn remove(&self, fp: &Fingerprint) {
        self.l1.remove(fp);
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.remove(fp).await {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = shared.name(), fingerprint = %fp, error = %e, "shared cache delete failed");
            }
        }
    }

    pub async fn clear(&self) {
        self.l1.clear();
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.clear().await {
                self.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = shared.name(), error = %e, "shared cache clear failed");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1: self.l1.stats(),
            l2_backend: self.shared.as_ref().map(|s| s.name().to_string()),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            l2_errors: self.l2_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::shared::DirectoryCache;
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenShared;

    #[async_trait]
    impl SharedCache for BrokenShared {
        fn name(&self) -> &str {
            "broken"
        }
        async fn get(&self, _fp: &Fingerprint) -> Result<Option<Value>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn put(&self, _fp: &Fingerprint, _v: &Value, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn remove(&self, _fp: &Fingerprint) -> Result<(), CacheError> {
            Ok(())
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s)
    }

    #[tokio::test]
    async fn l2_hit_promotes_to_l1() {
        let dir = tempfile::tempdir().unwrap();
        let shared: Arc<dyn SharedCache> = Arc::new(DirectoryCache::new(dir.path()).unwrap());

        // Another execution context populated the shared level.
        let writer = MultiLevelCache::new(L1Cache::new(8, 1), Some(Arc::clone(&shared)), Duration::from_secs(60));
        writer.put(&fp("k"), &json!("v")).await;

        let reader = MultiLevelCache::new(L1Cache::new(8, 1), Some(shared), Duration::from_secs(60));
        let first = reader.get(&fp("k")).await;
        assert_eq!(first.level, Some(CacheLevel::L2));
        assert_eq!(first.value, Some(json!("v")));

        let second = reader.get(&fp("k")).await;
        assert_eq!(second.level, Some(CacheLevel::L1));
        assert_eq!(reader.stats().l2_hits, 1);
    }

    #[tokio::test]
    async fn broken_l2_degrades_to_miss() {
        let cache = MultiLevelCache::new(L1Cache::new(8, 1), Some(Arc::new(BrokenShared)), Duration::from_secs(60));

        let lookup = cache.get(&fp("k")).await;
        assert!(lookup.value.is_none());
        assert_eq!(lookup.errors, 1);

        // The write still lands in L1.
        assert_eq!(cache.put(&fp("k"), &json!(1)).await, 1);
        assert_eq!(cache.get(&fp("k")).await.level, Some(CacheLevel::L1));
        assert_eq!(cache.stats().l2_errors, 2);
    }

    #[tokio::test]
    async fn l1_only_without_shared() {
        let cache = MultiLevelCache::new(L1Cache::new(8, 1), None, Duration::from_secs(60));
        assert!(cache.get(&fp("k")).await.value.is_none());
        cache.put(&fp("k"), &json!([1, 2])).await;
        assert_eq!(cache.get(&fp("k")).await.value, Some(json!([1, 2])));
        assert!(cache.stats().l2_backend.is_none());
    }

    #[tokio::test]
    async fn remove_clears_both_levels() {
        let dir = tempfile::tempdir().unwrap();
        let shared: Arc<dyn SharedCache> = Arc::new(DirectoryCache::new(dir.path()).unwrap());
        let cache = MultiLevelCache::new(L1Cache::new(8, 1), Some(shared), Duration::from_secs(60));
        cache.put(&fp("k"), &json!(1)).await;
        cache.remove(&fp("k")).await;
        assert!(cache.get(&fp("k")).await.value.is_none());
    }

    #[test]
    fn from_config_without_shared() {
        let cache = MultiLevelCache::from_config(&CacheConfig::default()).unwrap();
        assert_eq!(cache.l1().capacity(), 10_000);
    }
}

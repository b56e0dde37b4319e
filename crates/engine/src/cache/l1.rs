use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;

use super::fingerprint::Fingerprint;

/// A cached stage output with bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub value: Value,
    /// Serialized length of `value` in bytes.
    pub size_estimate: usize,
    pub inserted_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, value: Value) -> Self {
        let now = Utc::now();
        let size_estimate = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        Self {
            fingerprint,
            value,
            size_estimate,
            inserted_at: now,
            last_accessed_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct L1Stats {
    pub entries: usize,
    pub capacity: usize,
    pub shards: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// In-process LRU cache split into independently locked shards.
///
/// The total entry ceiling is divided across shards, so the cache never
/// holds more than `capacity` entries. Eviction is LRU within a shard; with a
/// single shard the order is exact global LRU.
pub struct L1Cache {
    shards: Vec<Mutex<LruCache<Fingerprint, CacheEntry>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl L1Cache {
    pub fn new(capacity: usize, shards: usize) -> Self {
        let capacity = capacity.max(1);
        let shard_count = shards.clamp(1, capacity);
        let base = capacity / shard_count;
        let remainder = capacity % shard_count;
        let shards = (0..shard_count)
            .map(|i| {
                let cap = base + usize::from(i < remainder);
                Mutex::new(LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN)))
            })
            .collect();
        Self {
            shards,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, fp: &Fingerprint) -> MutexGuard<'_, LruCache<Fingerprint, CacheEntry>> {
        let index = (fp.shard_key() % self.shards.len() as u64) as usize;
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, fp: &Fingerprint) -> Option<Value> {
        let mut shard = self.shard(fp);
        match shard.get_mut(fp) {
            Some(entry) => {
                entry.last_accessed_at = Utc::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace; evicts the shard's least-recently-used entry when full.
    pub fn put(&self, fp: Fingerprint, value: Value) {
        let entry = CacheEntry::new(fp.clone(), value);
        let mut shard = self.shard(&fp);
        if let Some((evicted, _)) = shard.push(fp.clone(), entry) {
            if evicted != fp {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.shard(fp).contains(fp)
    }

    pub fn remove(&self, fp: &Fingerprint) -> bool {
        self.shard(fp).pop(fp).is_some()
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> L1Stats {
        let (entries, bytes) = self.shards.iter().fold((0, 0), |(n, b), shard| {
            let shard = shard.lock().unwrap_or_else(|p| p.into_inner());
            let bytes: usize = shard.iter().map(|(_, e)| e.size_estimate).sum();
            (n + shard.len(), b + bytes)
        });
        L1Stats {
            entries,
            capacity: self.capacity,
            shards: self.shards.len(),
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

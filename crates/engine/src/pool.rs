//! Fixed-size pools of expensive, reusable resources (model clients, API
//! sessions, database connections).
//!
//! A pool never holds more than `size` live handles and never lends one
//! handle to two callers at once. Handles are created lazily on first use
//! (or eagerly via [`ResourcePool::warm_up`]), reused least-recently-used
//! first, and replaced after [`PooledResource::invalidate`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlflow_core::PoolConfig;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::error::PoolError;

/// A type-erased pooled resource. Stages downcast it to the concrete type.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Creates the resource for a pool slot.
///
/// Called lazily the first time a slot is handed out and again after the
/// slot's previous resource was invalidated.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    async fn create(&self, slot: usize) -> anyhow::Result<Resource>;
}

#[async_trait]
impl<F, Fut> ResourceFactory for F
where
    F: Fn(usize) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Resource>> + Send,
{
    async fn create(&self, slot: usize) -> anyhow::Result<Resource> {
        (self)(slot).await
    }
}

// ── Pool state ──────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    resource: Option<Resource>,
    /// Bumped on invalidation so a stale handle can never be reissued.
    generation: u64,
    created_at: Option<DateTime<Utc>>,
    last_used: Option<Instant>,
    last_used_at: Option<DateTime<Utc>>,
    failure_count: u32,
    busy: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    acquisitions: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    invalidations: AtomicU64,
}

struct PoolInner {
    name: String,
    size: usize,
    acquire_timeout: Duration,
    factory: Arc<dyn ResourceFactory>,
    permits: Arc<Semaphore>,
    slots: Mutex<Vec<Slot>>,
    counters: PoolCounters,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn give_back(&self, slot: usize, generation: u64, invalidate: bool) {
        let mut slots = self.slots();
        let Some(entry) = slots.get_mut(slot) else {
            return;
        };
        if entry.generation != generation || !entry.busy {
            return;
        }
        entry.busy = false;
        entry.last_used = Some(Instant::now());
        entry.last_used_at = Some(Utc::now());
        if invalidate {
            entry.resource = None;
            entry.created_at = None;
            entry.generation += 1;
            entry.failure_count += 1;
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.name, slot, "resource invalidated");
        }
    }
}

/// Point-in-time view of one pool slot.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceHandle {
    pub slot: usize,
    pub live: bool,
    pub busy: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

/// Pool occupancy and lifetime counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub size: usize,
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub created: u64,
    pub acquisitions: u64,
    /// Acquisitions that found no free handle and had to wait.
    pub waits: u64,
    pub timeouts: u64,
    pub invalidations: u64,
}

// ── ResourcePool ────────────────────────────────────────────────────

/// A bounded pool of interchangeable resources. Cheap to clone; clones share
/// the same slots.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    pub fn new(
        name: impl Into<String>,
        size: usize,
        acquire_timeout: Duration,
        factory: Arc<dyn ResourceFactory>,
    ) -> Self {
        let size = size.max(1);
        let slots = (0..size).map(|_| Slot::default()).collect();
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                size,
                acquire_timeout,
                factory,
                permits: Arc::new(Semaphore::new(size)),
                slots: Mutex::new(slots),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.inner.acquire_timeout
    }

    /// Borrow a resource using the pool's configured timeout.
    pub async fn acquire_default(&self) -> Result<PooledResource, PoolError> {
        self.acquire(self.inner.acquire_timeout).await
    }

    /// Borrow a resource, waiting at most `timeout` for one to free up.
    ///
    /// The least-recently-used idle live handle is preferred; otherwise an
    /// empty slot is filled via the factory. On timeout no handle is created.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledResource, PoolError> {
        let inner = &self.inner;
        let permit = match Arc::clone(&inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed(inner.name.clone())),
            Err(TryAcquireError::NoPermits) => {
                inner.counters.waits.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(timeout, Arc::clone(&inner.permits).acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::Closed(inner.name.clone())),
                    Err(_) => {
                        inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(pool = %inner.name, waited_ms = timeout.as_millis() as u64, "pool acquire timed out");
                        return Err(PoolError::Timeout {
                            pool: inner.name.clone(),
                            waited: timeout,
                        });
                    }
                }
            }
        };

        let (claim, existing) = self.claim_slot()?;
        let resource = match existing {
            Some(resource) => resource,
            None => self.fill_slot(claim.slot, claim.generation).await?,
        };
        let (slot, generation) = claim.keep();

        inner.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(PooledResource {
            pool: Arc::clone(inner),
            slot,
            generation,
            resource,
            permit: Some(permit),
        })
    }

    /// Mark the best free slot busy. A permit is held, so one always exists.
    fn claim_slot(&self) -> Result<(SlotClaim<'_>, Option<Resource>), PoolError> {
        let mut slots = self.inner.slots();
        let lru_live = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.busy && s.resource.is_some())
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i);
        let chosen = lru_live.or_else(|| slots.iter().position(|s| !s.busy));
        let Some(index) = chosen else {
            return Err(PoolError::Closed(self.inner.name.clone()));
        };
        let slot = &mut slots[index];
        slot.busy = true;
        let claim = SlotClaim {
            inner: &self.inner,
            slot: index,
            generation: slot.generation,
            armed: true,
        };
        Ok((claim, slot.resource.clone()))
    }

    async fn fill_slot(&self, slot: usize, generation: u64) -> Result<Resource, PoolError> {
        let inner = &self.inner;
        match inner.factory.create(slot).await {
            Ok(resource) => {
                let mut slots = inner.slots();
                let entry = &mut slots[slot];
                entry.resource = Some(Arc::clone(&resource));
                entry.created_at = Some(Utc::now());
                inner.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %inner.name, slot, "resource created");
                Ok(resource)
            }
            Err(e) => {
                let mut slots = inner.slots();
                let entry = &mut slots[slot];
                if entry.generation == generation {
                    entry.failure_count += 1;
                }
                warn!(pool = %inner.name, slot, error = %e, "resource creation failed");
                Err(PoolError::Create {
                    pool: inner.name.clone(),
                    message: format!("{e:#}"),
                })
            }
        }
    }

    /// Create every missing handle up front.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        let mut handles = Vec::with_capacity(self.inner.size);
        for _ in 0..self.inner.size {
            handles.push(self.acquire(self.inner.acquire_timeout).await?);
        }
        for handle in handles {
            handle.release();
        }
        info!(pool = %self.inner.name, size = self.inner.size, "pool warmed up");
        Ok(())
    }

    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.inner
            .slots()
            .iter()
            .enumerate()
            .map(|(slot, s)| ResourceHandle {
                slot,
                live: s.resource.is_some(),
                busy: s.busy,
                created_at: s.created_at,
                last_used_at: s.last_used_at,
                failure_count: s.failure_count,
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let (live, busy) = {
            let slots = inner.slots();
            (
                slots.iter().filter(|s| s.resource.is_some()).count(),
                slots.iter().filter(|s| s.busy).count(),
            )
        };
        PoolStats {
            name: inner.name.clone(),
            size: inner.size,
            live,
            idle: live.saturating_sub(busy),
            busy,
            created: inner.counters.created.load(Ordering::Relaxed),
            acquisitions: inner.counters.acquisitions.load(Ordering::Relaxed),
            waits: inner.counters.waits.load(Ordering::Relaxed),
            timeouts: inner.counters.timeouts.load(Ordering::Relaxed),
            invalidations: inner.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// A slot marked busy by an acquire that has not yet produced a handle.
///
/// Dropping an armed claim frees the slot again, so an acquire future that
/// is dropped mid-creation (or a factory that panics) cannot strand it.
struct SlotClaim<'a> {
    inner: &'a PoolInner,
    slot: usize,
    generation: u64,
    armed: bool,
}

impl SlotClaim<'_> {
    /// The acquire succeeded; the slot now belongs to a [`PooledResource`].
    fn keep(mut self) -> (usize, u64) {
        self.armed = false;
        (self.slot, self.generation)
    }
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.inner.slots();
        if let Some(entry) = slots.get_mut(self.slot) {
            if entry.generation == self.generation {
                entry.busy = false;
            }
        }
    }
}

// ── PooledResource ──────────────────────────────────────────────────

/// A resource on loan from a pool. Dropping it returns it to the pool.
pub struct PooledResource {
    pool: Arc<PoolInner>,
    slot: usize,
    generation: u64,
    resource: Resource,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledResource {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.resource.downcast_ref::<T>()
    }

    /// Return the handle for reuse.
    pub fn release(mut self) {
        self.finish(false);
    }

    /// Return the handle and discard its resource; the slot is refilled
    /// through the factory on a later acquire.
    pub fn invalidate(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, invalidate: bool) {
        if let Some(permit) = self.permit.take() {
            self.pool.give_back(self.slot, self.generation, invalidate);
            drop(permit);
        }
    }
}

impl Drop for PooledResource {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl std::fmt::Debug for PooledResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledResource")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Named pools for one run.
#[derive(Clone, Default)]
pub struct ResourcePools {
    pools: HashMap<String, ResourcePool>,
    warm: Vec<String>,
}

impl std::fmt::Debug for ResourcePools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePools")
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("warm", &self.warm)
            .finish()
    }
}

impl ResourcePools {
    /// Build every configured pool. Each needs a registered factory.
    pub fn from_config(
        configs: &BTreeMap<String, PoolConfig>,
        mut factories: HashMap<String, Arc<dyn ResourceFactory>>,
    ) -> Result<Self, PoolError> {
        let mut pools = HashMap::new();
        let mut warm = Vec::new();
        for (name, cfg) in configs {
            let factory = factories
                .remove(name)
                .ok_or_else(|| PoolError::MissingFactory(name.clone()))?;
            pools.insert(
                name.clone(),
                ResourcePool::new(name.clone(), cfg.size, cfg.acquire_timeout(), factory),
            );
            if cfg.warm {
                warm.push(name.clone());
            }
        }
        for name in factories.keys() {
            debug!(pool = %name, "resource factory registered without a configured pool");
        }
        Ok(Self { pools, warm })
    }

    pub fn insert(&mut self, pool: ResourcePool) {
        self.pools.insert(pool.name().to_string(), pool);
    }

    pub fn get(&self, name: &str) -> Result<&ResourcePool, PoolError> {
        self.pools
            .get(name)
            .ok_or_else(|| PoolError::UnknownPool(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn has_warm_pools(&self) -> bool {
        !self.warm.is_empty()
    }

    /// Warm the pools configured with `warm = true`.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        for name in &self.warm {
            self.get(name)?.warm_up().await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.values().map(ResourcePool::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

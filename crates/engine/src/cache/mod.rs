//! Two-level result cache for stage outputs.
//!
//! - `fingerprint`: content hash of (stage, stage config, task snapshot)
//! - `l1`: sharded in-process LRU
//! - `shared`: the L2 trait plus the shared-directory backend
//! - `redis`: Redis L2 backend (feature `redis`)
//! - `multi`: the read-through/write-through combination of both levels

pub mod fingerprint;
pub mod l1;
pub mod multi;
pub mod redis;
pub mod shared;

pub use fingerprint::Fingerprint;
pub use l1::{CacheEntry, L1Cache, L1Stats};
pub use multi::{CacheLevel, CacheLookup, CacheStats, MultiLevelCache};
pub use redis::RedisCache;
pub use shared::{build_shared_cache, DirectoryCache, SharedCache};

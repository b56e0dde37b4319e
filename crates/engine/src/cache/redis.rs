//! Redis shared cache backend (requires the `redis` feature).
//!
//! Entries are JSON strings stored with `SET EX`, so expiry is handled by
//! the server. Without the feature every operation fails with a clear
//! message and the multi-level cache degrades to L1 only.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::fingerprint::Fingerprint;
use super::shared::SharedCache;
use crate::error::CacheError;

const KEY_PREFIX: &str = "sqlflow:cache:";

fn key(fp: &Fingerprint) -> String {
    format!("{KEY_PREFIX}{fp}")
}

#[cfg(feature = "redis")]
pub struct RedisCache {
    client: ::redis::Client,
}

#[cfg(feature = "redis")]
impl RedisCache {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url).map_err(backend)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<::redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)
    }
}

#[cfg(feature = "redis")]
fn backend(e: ::redis::RedisError) -> CacheError {
    CacheError::Backend(e.to_string())
}

#[cfg(feature = "redis")]
#[async_trait]
impl SharedCache for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Option<Value>, CacheError> {
        use ::redis::AsyncCommands;
        let mut con = self.connection().await?;
        let raw: Option<String> = con.get(key(fp)).await.map_err(backend)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, fp: &Fingerprint, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        use ::redis::AsyncCommands;
        let mut con = self.connection().await?;
        let json = serde_json::to_string(value)?;
        con.set_ex::<_, _, ()>(key(fp), json, ttl.as_secs().max(1))
            .await
            .map_err(backend)
    }

    async fn remove(&self, fp: &Fingerprint) -> Result<(), CacheError> {
        use ::redis::AsyncCommands;
        let mut con = self.connection().await?;
        con.del::<_, ()>(key(fp)).await.map_err(backend)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        use ::redis::AsyncCommands;
        let mut con = self.connection().await?;
        let keys: Vec<String> = con.keys(format!("{KEY_PREFIX}*")).await.map_err(backend)?;
        if !keys.is_empty() {
            con.del::<_, ()>(keys).await.map_err(backend)?;
        }
        Ok(())
    }
}

// ── Feature-disabled stub ───────────────────────────────────────────

#[cfg(not(feature = "redis"))]
#[derive(Debug)]
pub struct RedisCache;

#[cfg(not(feature = "redis"))]
const DISABLED: &str = "Redis shared cache requires the 'redis' Cargo feature";

#[cfg(not(feature = "redis"))]
impl RedisCache {
    pub fn new(_url: &str) -> Result<Self, CacheError> {
        Err(CacheError::Backend(DISABLED.into()))
    }
}

#[cfg(not(feature = "redis"))]
#[async_trait]
impl SharedCache for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, _fp: &Fingerprint) -> Result<Option<Value>, CacheError> {
        Err(CacheError::Backend(DISABLED.into()))
    }

    async fn put(&self, fp: &Fingerprint, _value: &Value, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Backend(format!("{DISABLED} (key {})", key(fp))))
    }

    async fn remove(&self, _fp: &Fingerprint) -> Result<(), CacheError> {
        Err(CacheError::Backend(DISABLED.into()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Err(CacheError::Backend(DISABLED.into()))
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlflow_core::{SharedCacheConfig, SharedCacheKind};
use tracing::debug;

use super::fingerprint::Fingerprint;
use super::redis::RedisCache;
use crate::error::CacheError;

/// A cache level visible to every execution context of a run (and to later
/// runs). Implementations must tolerate concurrent writers of the same key.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Fetch a live entry. Expired entries are reported as misses.
    async fn get(&self, fp: &Fingerprint) -> Result<Option<Value>, CacheError>;

    async fn put(&self, fp: &Fingerprint, value: &Value, ttl: Duration) -> Result<(), CacheError>;

    async fn remove(&self, fp: &Fingerprint) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

/// Build the configured shared cache backend.
pub fn build_shared_cache(config: &SharedCacheConfig) -> Result<Arc<dyn SharedCache>, CacheError> {
    match config.kind {
        SharedCacheKind::Directory => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| CacheError::Backend("directory cache requires a path".into()))?;
            Ok(Arc::new(DirectoryCache::new(path)?))
        }
        SharedCacheKind::Redis => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| CacheError::Backend("redis cache requires a url".into()))?;
            Ok(Arc::new(RedisCache::new(url)?))
        }
    }
}

// ── Directory backend ───────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    fingerprint: Fingerprint,
    value: Value,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Shared cache backed by one JSON file per fingerprint in a directory.
///
/// Writes go to a unique temp file and are renamed into place, so readers
/// never see a partial entry and concurrent writers of the same key simply
/// race to the last rename. Expired entries are deleted when next read.
pub struct DirectoryCache {
    dir: PathBuf,
}

impl DirectoryCache {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{fp}.json"))
    }
}

#[async_trait]
impl SharedCache for DirectoryCache {
    fn name(&self) -> &str {
        "directory"
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Option<Value>, CacheError> {
        let path = self.entry_path(fp);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: StoredEntry = serde_json::from_slice(&bytes)?;
        if entry.expires_at <= Utc::now() {
            debug!(fingerprint = %fp, "shared cache entry expired");
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn put(&self, fp: &Fingerprint, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let entry = StoredEntry {
            fingerprint: fp.clone(),
            value: value.clone(),
            inserted_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let json = serde_json::to_vec(&entry)?;
        let tmp = self.dir.join(format!(".{fp}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.entry_path(fp)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, fp: &Fingerprint) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.entry_path(fp)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".json") {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s)
    }

    #[tokio::test]
    async fn round_trip_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path()).unwrap();

        assert!(cache.get(&fp("abc")).await.unwrap().is_none());
        cache
            .put(&fp("abc"), &json!({"sql": "SELECT 1"}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get(&fp("abc")).await.unwrap(),
            Some(json!({"sql": "SELECT 1"}))
        );
    }

    #[tokio::test]
    async fn expired_entries_are_removed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path()).unwrap();
        cache.put(&fp("old"), &json!(1), Duration::ZERO).await.unwrap();

        assert!(cache.get(&fp("old")).await.unwrap().is_none());
        assert!(!dir.path().join("old.json").exists());
    }

    #[tokio::test]
    async fn last_write_wins_and_no_temp_files_remain() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path()).unwrap();
        let ttl = Duration::from_secs(60);
        cache.put(&fp("k"), &json!("first"), ttl).await.unwrap();
        cache.put(&fp("k"), &json!("second"), ttl).await.unwrap();

        assert_eq!(cache.get(&fp("k")).await.unwrap(), Some(json!("second")));
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(matches!(
            cache.get(&fp("bad")).await,
            Err(CacheError::Json(_))
        ));
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path()).unwrap();
        let ttl = Duration::from_secs(60);
        cache.put(&fp("a"), &json!(1), ttl).await.unwrap();
        cache.put(&fp("b"), &json!(2), ttl).await.unwrap();

        cache.remove(&fp("a")).await.unwrap();
        cache.remove(&fp("a")).await.unwrap();
        assert!(cache.get(&fp("a")).await.unwrap().is_none());

        cache.clear().await.unwrap();
        assert!(cache.get(&fp("b")).await.unwrap().is_none());
    }
}

//! Advisory provider-response cache
//!
//! Content-addressed by `task_digest(capability, args)`, one JSON file per
//! key. Every failure degrades to a miss: the cache can never fail a task.

use crate::config::CacheSettings;
use crate::digest::task_digest;
use crate::models::Capability;
use crate::providers::ProviderResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

type CacheResult<T> = std::result::Result<T, CacheError>;

/// On-disk entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub capability: Capability,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    /// Entries that could not be read or parsed.
    pub corrupt: usize,
    pub approx_size_bytes: u64,
}

pub struct Cache {
    dir: PathBuf,
    ttl: Duration,
    enabled: bool,
    write_warned: AtomicBool,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            enabled: true,
            write_warned: AtomicBool::new(false),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        if settings.enabled {
            Self::new(settings.dir.clone(), settings.ttl)
        } else {
            Self::disabled()
        }
    }

    /// Every `get` misses, every `set` is a no-op.
    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            ttl: Duration::ZERO,
            enabled: false,
            write_warned: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.timestamp);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age >= ttl,
            Err(_) => false,
        }
    }

    pub async fn get(&self, capability: Capability, args: &Value) -> Option<ProviderResponse> {
        if !self.enabled {
            return None;
        }

        let key = task_digest(capability.as_str(), args);
        let path = self.path_for(&key);

        match self.read_entry(&path).await {
            Ok(Some(entry)) => {
                if entry.key != key || self.is_expired(&entry, Utc::now()) {
                    debug!(key = %key, "cache entry expired");
                    self.remove_quietly(&path).await;
                    return None;
                }
                debug!(key = %key, capability = %capability, "cache hit");
                Some(ProviderResponse {
                    data: entry.data,
                    source: entry.source,
                })
            }
            Ok(None) => None,
            Err(CacheError::Corrupt(e)) => {
                debug!(key = %key, error = %e, "dropping corrupt cache entry");
                self.remove_quietly(&path).await;
                None
            }
            Err(e) => {
                debug!(key = %key, error = %e, "cache read failed");
                None
            }
        }
    }

    pub async fn set(&self, capability: Capability, args: &Value, response: &ProviderResponse) {
        if !self.enabled {
            return;
        }

        let key = task_digest(capability.as_str(), args);
        let entry = CacheEntry {
            key: key.clone(),
            capability,
            timestamp: Utc::now(),
            data: response.data.clone(),
            source: response.source.clone(),
        };

        if let Err(e) = self.write_entry(&key, &entry).await {
            if !self.write_warned.swap(true, Ordering::Relaxed) {
                warn!(dir = %self.dir.display(), error = %e, "cache write failed; continuing uncached");
            } else {
                debug!(key = %key, error = %e, "cache write failed");
            }
        }
    }

    async fn read_entry(&self, path: &Path) -> CacheResult<Option<CacheEntry>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write_entry(&self, key: &str, entry: &CacheEntry) -> CacheResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec(entry)?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(key)).await {
            self.remove_quietly(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_quietly(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "cache delete failed");
            }
        }
    }

    async fn entry_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if !self.enabled {
            return paths;
        }

        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(_) => return paths,
        };

        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths
    }

    /// Deletes expired and unreadable entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;

        for path in self.entry_paths().await {
            let stale = match self.read_entry(&path).await {
                Ok(Some(entry)) => self.is_expired(&entry, now),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale {
                self.remove_quietly(&path).await;
                removed += 1;
            }
        }
        removed
    }

    pub async fn purge_all(&self) -> usize {
        let mut removed = 0;
        for path in self.entry_paths().await {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let mut stats = CacheStats::default();

        for path in self.entry_paths().await {
            match self.read_entry(&path).await {
                Ok(Some(entry)) if self.is_expired(&entry, now) => stats.expired += 1,
                Ok(Some(_)) => stats.valid += 1,
                // removed since the listing
                Ok(None) => continue,
                Err(_) => stats.corrupt += 1,
            }
            stats.total += 1;
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                stats.approx_size_bytes += meta.len();
            }
        }
        stats
    }
}

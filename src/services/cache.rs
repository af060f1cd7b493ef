//! Short-lived cache of issued retrieval links.
//!
//! `TransferCache` stores serialized [`TransferDescriptor`]s behind a
//! string-keyed [`CacheBackend`] with per-entry TTL. Entries never outlive the
//! URL they carry: the TTL is capped at the issuer's validity window and a
//! descriptor past its `expires_at` is reported as a miss.

use crate::config::ConfigError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
    #[error("malformed cache entry `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding cache entry `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// String-keyed get/set/delete with TTL. `Ok(None)` means "not found";
/// `Err` is reserved for transport failures.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Writes between full sweeps of expired entries.
const SWEEP_EVERY: usize = 64;

/// Process-local backend. Expired entries are evicted when read, and every
/// `SWEEP_EVERY` writes drop whatever else has expired, so the map holds at
/// most the keys written within one TTL plus one sweep interval.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    writes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some((value, deadline)) if *deadline > now => return Ok(Some(value.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|(_, deadline)| *deadline <= now)
        {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            let before = entries.len();
            entries.retain(|_, (_, deadline)| *deadline > now);
            debug!(evicted = before - entries.len(), "swept expired cache entries");
        }
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Cached signed URL plus the display metadata shown next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub object_key: String,
    pub url: String,
    pub file_name: String,
    pub size: i64,
    pub file_type: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TransferCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    max_ttl: Duration,
}

impl TransferCache {
    /// `url_validity` bounds every TTL this cache will ever use.
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        ttl: Duration,
        url_validity: Duration,
    ) -> Result<Self, ConfigError> {
        if ttl > url_validity {
            return Err(ConfigError::CacheTtlExceedsUrlValidity {
                ttl_secs: ttl.as_secs(),
                validity_secs: url_validity.as_secs(),
            });
        }
        Ok(Self {
            backend,
            ttl,
            max_ttl: url_validity,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn cache_key(object_key: &str) -> String {
        format!("transfer:{object_key}")
    }

    pub async fn lookup(&self, object_key: &str) -> Result<Option<TransferDescriptor>, CacheError> {
        let key = Self::cache_key(object_key);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        let descriptor: TransferDescriptor =
            serde_json::from_str(&raw).map_err(|source| CacheError::Decode {
                key: key.clone(),
                source,
            })?;

        if descriptor.expires_at <= Utc::now() {
            debug!(object_key, "cached descriptor outlived its url");
            return Ok(None);
        }
        Ok(Some(descriptor))
    }

    /// Store `descriptor` for `object_key`. TTLs above the URL validity window
    /// are clamped to it.
    pub async fn store(
        &self,
        object_key: &str,
        descriptor: &TransferDescriptor,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = Self::cache_key(object_key);
        let raw = serde_json::to_string(descriptor).map_err(|source| CacheError::Encode {
            key: key.clone(),
            source,
        })?;
        self.backend.set(&key, raw, ttl.min(self.max_ttl)).await
    }

    pub async fn invalidate(&self, object_key: &str) -> Result<(), CacheError> {
        self.backend.delete(&Self::cache_key(object_key)).await
    }
}

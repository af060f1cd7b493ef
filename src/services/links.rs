//! Cache-first retrieval links.
//!
//! A descriptor for a file is served from the [`TransferCache`] when present;
//! otherwise a URL is issued and the descriptor cached. Cache failures never
//! fail a lookup, they only cost an extra presign.

use crate::{
    models::file::FileRecord,
    services::{
        cache::{CacheError, TransferCache, TransferDescriptor},
        presign::{IssueError, UrlIssuer},
    },
};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LinkResolver {
    cache: TransferCache,
    issuer: UrlIssuer,
}

impl LinkResolver {
    pub fn new(cache: TransferCache, issuer: UrlIssuer) -> Self {
        Self { cache, issuer }
    }

    pub async fn resolve(&self, file: &FileRecord) -> Result<TransferDescriptor, IssueError> {
        let key = file.object_key.as_str();
        match self.cache.lookup(key).await {
            Ok(Some(descriptor)) => {
                debug!(key, "transfer cache hit");
                return Ok(descriptor);
            }
            Ok(None) => debug!(key, "transfer cache miss"),
            Err(err) => warn!(key, error = %err, "transfer cache lookup failed, presigning"),
        }

        let issued = self.issuer.issue(key).await?;
        let descriptor = TransferDescriptor {
            object_key: file.object_key.clone(),
            url: issued.url,
            file_name: file.file_name.clone(),
            size: file.size_bytes,
            file_type: file.file_type.clone(),
            expires_at: issued.expires_at,
        };
        if let Err(err) = self.cache.store(key, &descriptor, self.cache.ttl()).await {
            warn!(key, error = %err, "failed to cache transfer descriptor");
        }
        Ok(descriptor)
    }

    /// Drop any cached descriptor for `object_key`. Called by the same
    /// request that renames or deletes the file.
    pub async fn forget(&self, object_key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(object_key).await
    }
}

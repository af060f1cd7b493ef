//! Time-bounded retrieval URLs signed by the object store.

use crate::services::object_store::{ObjectStore, StoreError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
#[error("presigning `{key}` failed: {source}")]
pub struct IssueError {
    pub key: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Issues read-only URLs valid for a fixed window. Holds no state of its own.
#[derive(Clone)]
pub struct UrlIssuer {
    store: Arc<dyn ObjectStore>,
    validity: Duration,
}

impl UrlIssuer {
    pub fn new(store: Arc<dyn ObjectStore>, validity: Duration) -> Self {
        Self { store, validity }
    }

    pub async fn issue(&self, key: &str) -> Result<PresignedUrl, IssueError> {
        let issued_at = Utc::now();
        let url = self
            .store
            .presign_get(key, self.validity)
            .await
            .map_err(|source| {
                error!(key, error = %source, "failed to presign url");
                IssueError {
                    key: key.to_string(),
                    source,
                }
            })?;

        let window = TimeDelta::from_std(self.validity).unwrap_or(TimeDelta::MAX);
        debug!(key, validity_secs = self.validity.as_secs(), "issued presigned url");
        Ok(PresignedUrl {
            url,
            issued_at,
            expires_at: issued_at.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC),
        })
    }
}

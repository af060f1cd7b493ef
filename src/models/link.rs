//! Public share links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An unauthenticated, time-limited handle on one file.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct SharedLink {
    /// Random token that appears in `/share/{token}`.
    pub share_token: String,

    pub file_id: Uuid,

    pub object_key: String,

    /// Display name at the time the link was created; used for the download.
    pub file_name: String,

    pub expires_at: DateTime<Utc>,
}

impl SharedLink {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

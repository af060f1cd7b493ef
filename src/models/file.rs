//! A file owned by a user and stored, encrypted, in the remote bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row for one uploaded file. The payload itself lives in the
/// object store under `object_key`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    pub id: Uuid,

    pub owner_id: Uuid,

    /// Display name; changes on rename, unlike `object_key`.
    pub file_name: String,

    /// Generated store key (`{uuid}` or `{uuid}.{ext}`). Never user-supplied.
    pub object_key: String,

    pub size_bytes: i64,

    /// Extension-derived type, empty when the upload had none.
    pub file_type: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub accessed_at: Option<DateTime<Utc>>,

    /// Set by a soft delete; the hard-delete worker removes the row later.
    pub deleted_at: Option<DateTime<Utc>>,

    /// Set when a background upload failed. The payload is still only in the
    /// staging directory and the store has no object under `object_key`.
    pub upload_failed_at: Option<DateTime<Utc>>,

    pub upload_error: Option<String>,
}

impl FileRecord {
    pub fn is_uploaded(&self) -> bool {
        self.upload_failed_at.is_none()
    }
}

/// Fields supplied by the caller when a file record is created.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub owner_id: Uuid,
    pub file_name: String,
    pub size_bytes: i64,
    pub file_type: String,
}

impl NewFile {
    /// Build a record for an upload named `file_name`, deriving the type from
    /// its extension.
    pub fn named(owner_id: Uuid, file_name: &str, size_bytes: i64) -> Self {
        Self {
            owner_id,
            file_name: file_name.to_string(),
            size_bytes,
            file_type: extension_of(file_name).unwrap_or_default(),
        }
    }

    /// Object key for a record with `id`: the id, plus the extension if any.
    pub fn object_key(&self, id: Uuid) -> String {
        if self.file_type.is_empty() {
            id.to_string()
        } else {
            format!("{id}.{}", self.file_type)
        }
    }
}

/// Lower-cased extension restricted to ASCII alphanumerics, so it is safe to
/// splice into an object key.
fn extension_of(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 16 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

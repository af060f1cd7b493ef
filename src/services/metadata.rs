//! SQLite-backed file and shared-link records.
//!
//! The transfer engine never touches this store; handlers and the cleanup
//! workers combine the two. UUIDs and timestamps are bound through sqlx's
//! `uuid` and `chrono` support.

use crate::{
    models::{
        file::{FileRecord, NewFile},
        link::SharedLink,
    },
    services::staging::{StagedFile, UploadLedger},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema applied by [`MetadataStore::migrate`].
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str = "id, owner_id, file_name, object_key, size_bytes, file_type, \
                            created_at, updated_at, accessed_at, deleted_at, \
                            upload_failed_at, upload_error";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Clone)]
pub struct MetadataStore {
    db: SqlitePool,
}

impl MetadataStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|stmt| !stmt.is_empty())
            .collect::<Vec<_>>();

        info!(count = statements.len(), "applying schema statements");
        for stmt in statements {
            debug!(sql = stmt, "executing migration statement");
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }

    pub async fn insert_file(&self, new: &NewFile) -> MetadataResult<FileRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "INSERT INTO files (id, owner_id, file_name, object_key, size_bytes, file_type,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(id)
        .bind(new.owner_id)
        .bind(&new.file_name)
        .bind(new.object_key(id))
        .bind(new.size_bytes)
        .bind(&new.file_type)
        .bind(now)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        debug!(id = %record.id, key = %record.object_key, "inserted file record");
        Ok(record)
    }

    /// Fetch a file that has not been soft-deleted.
    pub async fn get_live_file(&self, id: Uuid) -> MetadataResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| file_not_found(id))
    }

    pub async fn list_live(&self, owner_id: Uuid) -> MetadataResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE owner_id = ? AND deleted_at IS NULL
             ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.db)
        .await?;
        Ok(files)
    }

    pub async fn list_deleted(&self, owner_id: Uuid) -> MetadataResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE owner_id = ? AND deleted_at IS NOT NULL
             ORDER BY deleted_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.db)
        .await?;
        Ok(files)
    }

    pub async fn rename(&self, id: Uuid, file_name: &str) -> MetadataResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET file_name = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(file_name)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| file_not_found(id))
    }

    pub async fn soft_delete(&self, id: Uuid) -> MetadataResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE files SET deleted_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(file_not_found(id));
        }
        Ok(())
    }

    pub async fn touch_accessed(&self, id: Uuid) -> MetadataResult<()> {
        sqlx::query("UPDATE files SET accessed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Flag the record behind `object_key` as never having reached the store.
    pub async fn mark_upload_failed(&self, object_key: &str, reason: &str) -> MetadataResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE files SET upload_failed_at = ?, upload_error = ?, updated_at = ?
             WHERE object_key = ?",
        )
        .bind(now)
        .bind(reason)
        .bind(now)
        .bind(object_key)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound {
                entity: "file",
                id: object_key.to_string(),
            });
        }
        Ok(())
    }

    /// Files soft-deleted at or before `cutoff`.
    pub async fn due_for_hard_delete(
        &self,
        cutoff: DateTime<Utc>,
    ) -> MetadataResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE deleted_at IS NOT NULL AND deleted_at <= ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(files)
    }

    /// Remove a file row and any links pointing at it.
    pub async fn hard_delete(&self, id: Uuid) -> MetadataResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM shared_links WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(file_not_found(id));
        }
        Ok(())
    }

    pub async fn create_link(&self, link: &SharedLink) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO shared_links (share_token, file_id, object_key, file_name, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&link.share_token)
        .bind(link.file_id)
        .bind(&link.object_key)
        .bind(&link.file_name)
        .bind(link.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_link(&self, token: &str) -> MetadataResult<SharedLink> {
        sqlx::query_as::<_, SharedLink>(
            "SELECT share_token, file_id, object_key, file_name, expires_at
             FROM shared_links WHERE share_token = ?",
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| MetadataError::NotFound {
            entity: "shared link",
            id: token.to_string(),
        })
    }

    /// Delete links that expired at or before `now`. Returns how many went.
    pub async fn purge_expired_links(&self, now: DateTime<Utc>) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM shared_links WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UploadLedger for MetadataStore {
    async fn record_failure(&self, file: &StagedFile, reason: &str) -> anyhow::Result<()> {
        self.mark_upload_failed(&file.object_key, reason).await?;
        Ok(())
    }
}

fn file_not_found(id: Uuid) -> MetadataError {
    MetadataError::NotFound {
        entity: "file",
        id: id.to_string(),
    }
}

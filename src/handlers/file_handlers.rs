//! File upload, listing, link, rename and delete handlers.

use crate::{
    errors::AppError,
    handlers::Owner,
    models::file::{FileRecord, NewFile},
    services::{cache::TransferDescriptor, staging::StagedFile, state::AppState},
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::{info, warn};
use uuid::Uuid;

/// Multipart field that carries uploaded files.
const FILES_FIELD: &str = "files";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Upload before responding.
    #[default]
    Sync,
    /// Respond once files are on local disk; upload in the background.
    Staged,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub mode: Option<UploadMode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StagedResponse {
    pub status: String,
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub file_name: String,
}

/// A live file together with a retrieval link. Files whose background upload
/// failed carry no link.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileView {
    pub id: Uuid,
    pub file_name: String,
    pub size_bytes: i64,
    pub file_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: Option<String>,
    pub url_expires_at: Option<DateTime<Utc>>,
    pub upload_failed_at: Option<DateTime<Utc>>,
}

impl FileView {
    fn new(file: FileRecord, link: Option<TransferDescriptor>) -> Self {
        let (url, url_expires_at) = link
            .map(|link| (Some(link.url), Some(link.expires_at)))
            .unwrap_or_default();
        Self {
            id: file.id,
            file_name: file.file_name,
            size_bytes: file.size_bytes,
            file_type: file.file_type,
            created_at: file.created_at,
            updated_at: file.updated_at,
            url,
            url_expires_at,
            upload_failed_at: file.upload_failed_at,
        }
    }
}

/// `POST /files?mode=sync|staged`
///
/// Every `files` part is spooled to the staging directory and given a file
/// record. In sync mode the batch is uploaded before responding and records of
/// files that failed are removed; in staged mode the batch is handed to the
/// background pipeline and the response is `202 Accepted`.
pub async fn upload_files(
    State(state): State<AppState>,
    owner: Owner,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mode = query.mode.unwrap_or_default();
    let mut staged: Vec<(StagedFile, Uuid)> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                abandon(&state, &staged).await;
                return Err(err.into());
            }
        };
        if field.name() != Some(FILES_FIELD) {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("upload")
            .to_string();

        let stream = field.map(|chunk| chunk.map_err(io::Error::other));
        let (path, size) = match state.staging.stage_stream(stream).await {
            Ok(spooled) => spooled,
            Err(err) => {
                abandon(&state, &staged).await;
                return Err(err.into());
            }
        };

        let new = NewFile::named(owner.0, &file_name, size as i64);
        let record = match state.metadata.insert_file(&new).await {
            Ok(record) => record,
            Err(err) => {
                state.staging.discard(&path).await;
                abandon(&state, &staged).await;
                return Err(err.into());
            }
        };
        staged.push((
            StagedFile {
                path,
                object_key: record.object_key,
                file_name: record.file_name,
            },
            record.id,
        ));
    }

    if staged.is_empty() {
        return Err(AppError::bad_request(format!(
            "no files found in multipart field `{FILES_FIELD}`"
        )));
    }

    let names = staged
        .iter()
        .map(|(file, _)| file.file_name.clone())
        .collect::<Vec<_>>();

    match mode {
        UploadMode::Staged => {
            let files = staged.into_iter().map(|(file, _)| file).collect();
            state.staging.spawn_batch(files, owner.0);
            info!(owner = %owner.0, files = names.len(), "staged upload accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(StagedResponse {
                    status: "processing".into(),
                    files: names,
                }),
            )
                .into_response())
        }
        UploadMode::Sync => {
            let ids = staged
                .iter()
                .map(|(file, id)| (file.object_key.clone(), *id))
                .collect::<Vec<_>>();
            let report = state
                .staging
                .run_batch(staged.into_iter().map(|(file, _)| file).collect())
                .await;

            let mut failed = Vec::with_capacity(report.failed.len());
            for (file, reason) in &report.failed {
                warn!(key = %file.object_key, error = %reason, "upload failed, dropping record");
                if let Some((_, id)) = ids.iter().find(|(key, _)| *key == file.object_key) {
                    if let Err(err) = state.metadata.hard_delete(*id).await {
                        warn!(id = %id, error = %err, "failed to drop record of failed upload");
                    }
                }
                state.staging.discard(&file.path).await;
                failed.push(file.file_name.clone());
            }

            if report.uploaded.is_empty() {
                return Err(AppError::internal("no files were uploaded"));
            }
            Ok(Json(UploadResponse {
                uploaded: report.uploaded_names(),
                failed,
            })
            .into_response())
        }
    }
}

/// Undo a partially received upload request.
async fn abandon(state: &AppState, staged: &[(StagedFile, Uuid)]) {
    for (file, id) in staged {
        state.staging.discard(&file.path).await;
        if let Err(err) = state.metadata.hard_delete(*id).await {
            warn!(id = %id, error = %err, "failed to drop record of abandoned upload");
        }
    }
}

/// `GET /files`
pub async fn list_files(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<Vec<FileView>>, AppError> {
    let files = state.metadata.list_live(owner.0).await?;
    let mut views = Vec::with_capacity(files.len());
    for file in files {
        let link = if file.is_uploaded() {
            Some(state.links.resolve(&file).await?)
        } else {
            None
        };
        views.push(FileView::new(file, link));
    }
    Ok(Json(views))
}

/// `GET /files/deleted`
pub async fn list_deleted(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    Ok(Json(state.metadata.list_deleted(owner.0).await?))
}

/// `GET /files/{id}/link` - cached retrieval link for one file.
pub async fn file_link(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<Uuid>,
) -> Result<Json<TransferDescriptor>, AppError> {
    let file = uploaded_file(&state, owner, id).await?;
    let link = state.links.resolve(&file).await?;
    if let Err(err) = state.metadata.touch_accessed(file.id).await {
        warn!(id = %file.id, error = %err, "failed to record access");
    }
    Ok(Json(link))
}

/// `PATCH /files/{id}` - rename. The cached descriptor is dropped before the
/// response, so the next link request carries the new name.
pub async fn rename_file(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<Uuid>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<FileRecord>, AppError> {
    let file_name = body.file_name.trim();
    if file_name.is_empty() {
        return Err(AppError::bad_request("file_name must not be empty"));
    }

    let file = owned_file(&state, owner, id).await?;
    let renamed = state.metadata.rename(file.id, file_name).await?;
    state.links.forget(&renamed.object_key).await?;
    info!(id = %id, from = %file.file_name, to = %renamed.file_name, "file renamed");
    Ok(Json(renamed))
}

/// `DELETE /files/{id}` - soft delete; the hard-delete worker removes the
/// object later.
pub async fn delete_file(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let file = owned_file(&state, owner, id).await?;
    state.metadata.soft_delete(file.id).await?;
    state.links.forget(&file.object_key).await?;
    info!(id = %id, key = %file.object_key, "file soft-deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Like [`owned_file`], but the payload must also have reached the store.
pub(crate) async fn uploaded_file(
    state: &AppState,
    owner: Owner,
    id: Uuid,
) -> Result<FileRecord, AppError> {
    let file = owned_file(state, owner, id).await?;
    if !file.is_uploaded() {
        return Err(AppError::conflict("file upload failed; no stored copy to link"));
    }
    Ok(file)
}

/// Fetch a live file and check that `owner` may act on it.
pub(crate) async fn owned_file(
    state: &AppState,
    owner: Owner,
    id: Uuid,
) -> Result<FileRecord, AppError> {
    let file = state.metadata.get_live_file(id).await?;
    if file.owner_id != owner.0 {
        return Err(AppError::forbidden("file belongs to another user"));
    }
    Ok(file)
}

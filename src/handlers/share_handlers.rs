//! Public share links.
//!
//! - POST /files/{id}/share -> mint a token for an owned file
//! - GET  /share/{token}    -> unauthenticated download while the token is valid

use crate::{
    errors::AppError,
    handlers::{Owner, file_handlers::uploaded_file},
    models::link::SharedLink,
    services::state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct ShareResponse {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// `POST /files/{id}/share`
pub async fn create_share(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let file = uploaded_file(&state, owner, id).await?;

    let ttl = TimeDelta::from_std(state.share_ttl)
        .map_err(|err| AppError::internal(format!("share ttl out of range: {err}")))?;
    let link = SharedLink {
        share_token: Uuid::new_v4().simple().to_string(),
        file_id: file.id,
        object_key: file.object_key,
        file_name: file.file_name,
        expires_at: Utc::now() + ttl,
    };
    state.metadata.create_link(&link).await?;
    info!(id = %id, expires_at = %link.expires_at, "share link created");

    Ok((
        StatusCode::CREATED,
        Json(ShareResponse {
            url: format!("{}/share/{}", state.public_base_url, link.share_token),
            expires_at: link.expires_at,
        }),
    ))
}

/// `GET /share/{token}`
///
/// Downloads and decrypts the object, returning it as an attachment named
/// after the file. 404 for unknown tokens, 410 once expired.
pub async fn serve_share(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let link = state.metadata.get_link(&token).await?;
    if link.is_expired_at(Utc::now()) {
        return Err(AppError::gone("share link has expired"));
    }

    let body = state.engine.download(&link.object_key).await?;
    if let Err(err) = state.metadata.touch_accessed(link.file_id).await {
        warn!(id = %link.file_id, error = %err, "failed to record access");
    }

    let length = body.len();
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&attachment(&link.file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// `Content-Disposition` value with the name reduced to characters that are
/// safe inside a quoted header parameter.
fn attachment(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_name_is_header_safe() {
        assert_eq!(attachment("report.pdf"), "attachment; filename=\"report.pdf\"");
        assert_eq!(
            attachment("a\"b\r\nc.txt"),
            "attachment; filename=\"a_b__c.txt\""
        );
        assert_eq!(attachment("résumé.pdf"), "attachment; filename=\"r_sum_.pdf\"");
    }
}

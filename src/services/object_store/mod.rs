//! Remote object-store protocol consumed by the transfer engine.
//!
//! Bucket + key addressing, whole-object put/get/delete, the multipart
//! create/upload-part/complete/abort cycle, and presigned GET URLs.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
pub mod memory;
mod s3;

pub use s3::{S3ObjectStore, S3Settings};

/// Store acknowledgement for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-based).
    pub part_number: i32,
    /// ETag returned by the store, required again at completion.
    pub etag: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("{operation} failed for `{key}`: {message}")]
    Request {
        operation: &'static str,
        key: String,
        message: String,
    },
    #[error("store returned no {what} for `{key}`")]
    MissingField { what: &'static str, key: String },
    #[error("invalid presign window for `{key}`: {message}")]
    Presign { key: String, message: String },
}

impl StoreError {
    pub fn request(operation: &'static str, key: &str, message: impl Into<String>) -> Self {
        StoreError::Request {
            operation,
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Low-level store operations, one implementation per backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Fetch the whole object. Missing keys yield [`StoreError::NotFound`].
    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Remove an object. Removing a missing key is not an error.
    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;

    /// Open a multipart session and return its upload id.
    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError>;

    /// Finalize a session. `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StoreError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;

    /// Signed, unauthenticated GET URL valid for `expires_in`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError>;
}

/// Base64 MD5 digest sent as `Content-MD5` so the store verifies what it got.
pub fn content_md5(body: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(body).0)
}

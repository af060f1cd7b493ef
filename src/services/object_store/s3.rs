//! `ObjectStore` backed by `aws-sdk-s3`.

use super::{CompletedPart, ObjectStore, StoreError, content_md5};
use crate::config::Secret;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::Credentials,
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart},
};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// Connection settings for the remote bucket.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: Secret<String>,
    pub bucket: String,
    /// Custom endpoint (MinIO, R2, ...). Switches to path-style addressing.
    pub endpoint: Option<String>,
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client with static credentials from `settings`.
    pub async fn connect(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.expose().clone(),
            None,
            None,
            "filedrop-static",
        );
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        }
    }
}

fn request_error<E>(operation: &'static str, key: &str, err: E) -> StoreError
where
    E: std::error::Error + 'static,
{
    StoreError::request(operation, key, DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(content_md5(&body))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| request_error("PutObject", key, err))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(service) if service.is_no_such_key() => StoreError::NotFound {
                    key: key.to_string(),
                },
                _ => request_error("GetObject", key, err),
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| request_error("GetObject body", key, err))?;
        Ok(data.into_bytes())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| request_error("DeleteObject", key, err))?;
        debug!(key, "deleted remote object");
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| request_error("CreateMultipartUpload", key, err))?;

        output
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| StoreError::MissingField {
                what: "upload id",
                key: key.to_string(),
            })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(content_md5(&body))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| request_error("UploadPart", key, err))?;

        let etag = output.e_tag().ok_or_else(|| StoreError::MissingField {
            what: "part etag",
            key: key.to_string(),
        })?;
        Ok(CompletedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StoreError> {
        let parts = parts
            .into_iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.etag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|err| request_error("CompleteMultipartUpload", key, err))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| request_error("AbortMultipartUpload", key, err))?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(expires_in).map_err(|err| {
            StoreError::Presign {
                key: key.to_string(),
                message: err.to_string(),
            }
        })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| request_error("PresignGetObject", key, err))?;
        Ok(request.uri().to_string())
    }
}

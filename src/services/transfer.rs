//! Transfer engine - moves encrypted payloads between the service and the
//! remote object store.
//!
//! Objects at or below `part_size` go up in one put; larger objects use a
//! multipart session whose parts are read sequentially from the source and
//! uploaded by a bounded pool of tasks. Both paths write the sealed segment
//! format from [`crate::services::crypto`], so `download` never needs to know
//! which path stored an object.

use crate::services::{
    crypto::{Codec, CryptoError},
    object_store::{CompletedPart, ObjectStore, StoreError},
};
use bytes::Bytes;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Smallest part the store accepts for anything but the last part.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Store-imposed ceiling on parts per multipart upload.
pub const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("reading source for `{key}`: {source}")]
    Source {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("source for `{key}` does not match declared size {expected} (read {actual})")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("`{key}` needs {parts} parts, more than the store allows ({MAX_PARTS})")]
    TooManyParts { key: String, parts: u64 },
    #[error("part upload task for `{key}` failed: {message}")]
    Task { key: String, message: String },
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => TransferError::NotFound { key },
            other => TransferError::Store(other),
        }
    }
}

/// Which upload path an object took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    SingleShot,
    Multipart { parts: u32 },
}

/// Completed parts and the first failure, shared by the part tasks of one upload.
#[derive(Default)]
struct PartLedger {
    completed: Vec<CompletedPart>,
    first_error: Option<TransferError>,
}

#[derive(Clone)]
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    codec: Arc<Codec>,
    part_size: usize,
    concurrency: usize,
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        codec: Arc<Codec>,
        part_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            codec,
            part_size: part_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn strategy_for(&self, total_size: u64) -> UploadStrategy {
        if total_size <= self.part_size as u64 {
            UploadStrategy::SingleShot
        } else {
            let parts = total_size.div_ceil(self.part_size as u64);
            UploadStrategy::Multipart {
                parts: u32::try_from(parts).unwrap_or(u32::MAX),
            }
        }
    }

    /// Encrypt and push `total_size` bytes from `source` to `key`.
    ///
    /// On failure no object exists at `key` and any multipart session has
    /// been aborted.
    pub async fn upload<R>(
        &self,
        key: &str,
        source: R,
        total_size: u64,
    ) -> Result<UploadStrategy, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if total_size.div_ceil(self.part_size as u64) > MAX_PARTS {
            return Err(TransferError::TooManyParts {
                key: key.to_string(),
                parts: total_size.div_ceil(self.part_size as u64),
            });
        }

        let strategy = self.strategy_for(total_size);
        match strategy {
            UploadStrategy::SingleShot => {
                info!(key, size = total_size, "uploading in a single request");
                self.upload_single(key, source, total_size).await?;
            }
            UploadStrategy::Multipart { parts } => {
                info!(key, size = total_size, parts, "uploading as multipart");
                self.upload_multipart(key, source, total_size, parts).await?;
            }
        }
        info!(key, "upload complete");
        Ok(strategy)
    }

    async fn upload_single<R>(
        &self,
        key: &str,
        mut source: R,
        total_size: u64,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buffer = Vec::with_capacity(total_size as usize);
        (&mut source)
            .take(total_size + 1)
            .read_to_end(&mut buffer)
            .await
            .map_err(|source| TransferError::Source {
                key: key.to_string(),
                source,
            })?;
        if buffer.len() as u64 != total_size {
            return Err(TransferError::SizeMismatch {
                key: key.to_string(),
                expected: total_size,
                actual: buffer.len() as u64,
            });
        }

        let sealed = self.codec.seal_segment(0, true, &buffer)?;
        self.store.put_object(key, Bytes::from(sealed)).await?;
        Ok(())
    }

    async fn upload_multipart<R>(
        &self,
        key: &str,
        source: R,
        total_size: u64,
        parts: u32,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let upload_id = self.store.create_multipart_upload(key).await?;
        debug!(key, upload_id = %upload_id, "opened multipart session");

        let mut completed = match self
            .dispatch_parts(key, &upload_id, source, total_size, parts)
            .await
        {
            Ok(completed) => completed,
            Err(err) => {
                error!(key, upload_id = %upload_id, error = %err, "multipart upload failed, aborting");
                self.abort(key, &upload_id).await;
                return Err(err);
            }
        };

        completed.sort_by_key(|part| part.part_number);
        if let Err(err) = self
            .store
            .complete_multipart_upload(key, &upload_id, completed)
            .await
        {
            error!(key, upload_id = %upload_id, error = %err, "completing multipart upload failed");
            self.abort(key, &upload_id).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Read `parts` chunks in order and upload each on the bounded pool.
    ///
    /// Stops dispatching once a part fails, but always waits for in-flight
    /// parts before returning.
    async fn dispatch_parts<R>(
        &self,
        key: &str,
        upload_id: &str,
        mut source: R,
        total_size: u64,
        parts: u32,
    ) -> Result<Vec<CompletedPart>, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let ledger = Arc::new(Mutex::new(PartLedger::default()));
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut offset = 0u64;

        for part_number in 1..=parts {
            if ledger.lock().await.first_error.is_some() {
                break;
            }

            // Taken before reading so at most `concurrency` chunks are resident.
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    record_failure(&ledger, TransferError::Task {
                        key: key.to_string(),
                        message: err.to_string(),
                    })
                    .await;
                    break;
                }
            };

            let is_final = part_number == parts;
            let chunk = match read_part(&mut source, key, offset, total_size, self.part_size, is_final)
                .await
            {
                Ok(chunk) => chunk,
                Err(err) => {
                    record_failure(&ledger, err).await;
                    break;
                }
            };
            offset += chunk.len() as u64;

            let store = Arc::clone(&self.store);
            let codec = Arc::clone(&self.codec);
            let ledger = Arc::clone(&ledger);
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = match codec.seal_segment(part_number - 1, is_final, &chunk) {
                    Ok(sealed) => store
                        .upload_part(&key, &upload_id, part_number as i32, Bytes::from(sealed))
                        .await
                        .map_err(TransferError::from),
                    Err(err) => Err(err.into()),
                };

                let mut ledger = ledger.lock().await;
                match outcome {
                    Ok(part) => {
                        debug!(key = %key, part = part_number, etag = %part.etag, "uploaded part");
                        ledger.completed.push(part);
                    }
                    Err(err) => {
                        error!(key = %key, part = part_number, error = %err, "part upload failed");
                        ledger.first_error.get_or_insert(err);
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                record_failure(&ledger, TransferError::Task {
                    key: key.to_string(),
                    message: err.to_string(),
                })
                .await;
            }
        }

        let mut ledger = ledger.lock().await;
        if let Some(err) = ledger.first_error.take() {
            return Err(err);
        }
        if ledger.completed.len() != parts as usize {
            return Err(TransferError::Task {
                key: key.to_string(),
                message: format!(
                    "expected {parts} completed parts, got {}",
                    ledger.completed.len()
                ),
            });
        }
        Ok(std::mem::take(&mut ledger.completed))
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        match self.store.abort_multipart_upload(key, upload_id).await {
            Ok(()) => info!(key, upload_id, "aborted multipart upload"),
            Err(err) => warn!(key, upload_id, error = %err, "failed to abort multipart upload"),
        }
    }

    /// Fetch `key` and return its decrypted contents.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, TransferError> {
        let sealed = self.store.get_object(key).await?;
        let plaintext = self.codec.open_object(&sealed)?;
        debug!(key, size = plaintext.len(), "downloaded object");
        Ok(plaintext)
    }

    pub async fn delete(&self, key: &str) -> Result<(), TransferError> {
        self.store.delete_object(key).await?;
        Ok(())
    }
}

async fn record_failure(ledger: &Mutex<PartLedger>, err: TransferError) {
    ledger.lock().await.first_error.get_or_insert(err);
}

/// Read the next part, checking the source against the declared size.
async fn read_part<R>(
    source: &mut R,
    key: &str,
    offset: u64,
    total_size: u64,
    part_size: usize,
    is_final: bool,
) -> Result<Vec<u8>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let source_error = |source| TransferError::Source {
        key: key.to_string(),
        source,
    };

    let expected = (total_size - offset).min(part_size as u64) as usize;
    let mut chunk = vec![0u8; expected];
    let filled = fill(source, &mut chunk).await.map_err(source_error)?;
    if filled < expected {
        return Err(TransferError::SizeMismatch {
            key: key.to_string(),
            expected: total_size,
            actual: offset + filled as u64,
        });
    }

    if is_final {
        let mut probe = [0u8; 1];
        let extra = source.read(&mut probe).await.map_err(source_error)?;
        if extra > 0 {
            return Err(TransferError::SizeMismatch {
                key: key.to_string(),
                expected: total_size,
                actual: total_size + extra as u64,
            });
        }
    }
    Ok(chunk)
}

/// Fill `buf` from `source`, tolerating short reads. Returns bytes read.
async fn fill<R>(source: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

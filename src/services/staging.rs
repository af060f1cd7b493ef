//! Staged uploads: files are spooled to local disk during the request, then
//! pushed to the store by a tracked background batch.
//!
//! A batch uploads every file concurrently through the [`TransferEngine`],
//! removes the local copy of each file that made it, keeps the copy of each
//! file that did not, and notifies the owner once at the end regardless of
//! individual outcomes. Batches run on a [`TaskTracker`] so the host can wait
//! for them on shutdown.

use crate::services::{notify::NotificationSink, transfer::TransferEngine};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
    task::{JoinHandle, JoinSet},
};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A file on local disk waiting to be pushed to `object_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub object_key: String,
    pub file_name: String,
}

/// Outcome of one batch. Failed entries carry the error message.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub uploaded: Vec<StagedFile>,
    pub failed: Vec<(StagedFile, String)>,
}

impl BatchReport {
    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploaded
            .iter()
            .map(|file| file.file_name.clone())
            .collect()
    }

    fn summary(&self) -> String {
        format!(
            "All files processed and uploaded: {} succeeded, {} failed.",
            self.uploaded.len(),
            self.failed.len()
        )
    }
}

/// Where background failures are written down so the files can be found and
/// reconciled later.
#[async_trait]
pub trait UploadLedger: Send + Sync {
    async fn record_failure(&self, file: &StagedFile, reason: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct StagingPipeline {
    dir: PathBuf,
    engine: TransferEngine,
    sink: Arc<dyn NotificationSink>,
    ledger: Option<Arc<dyn UploadLedger>>,
    tracker: TaskTracker,
}

impl StagingPipeline {
    pub fn new(dir: impl Into<PathBuf>, engine: TransferEngine, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            dir: dir.into(),
            engine,
            sink,
            ledger: None,
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn UploadLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Spool `stream` into the staging directory. Returns the staged path and
    /// the number of bytes written.
    ///
    /// Bytes go to a hidden temp file that is fsynced and then renamed, so a
    /// partially written upload never shows up under its staged name.
    pub async fn stage_stream<S>(&self, stream: S) -> io::Result<(PathBuf, u64)>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        fs::create_dir_all(&self.dir).await?;
        let staged_id = Uuid::new_v4();
        let tmp_path = self.dir.join(format!(".tmp-{staged_id}"));
        let final_path = self.dir.join(format!("{staged_id}.staged"));
        let mut file = File::create(&tmp_path).await?;

        let mut size = 0u64;
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => file.write_all(&chunk).await.map(|()| chunk.len()),
                Err(err) => Err(err),
            };
            match written {
                Ok(len) => size += len as u64,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            }
        }
        if let Err(err) = sync_and_close(file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Ok((final_path, size))
    }

    /// Remove a staged copy. Missing files are fine.
    pub async fn discard(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove staged file"),
        }
    }

    /// Upload every file concurrently, one task per file.
    pub async fn run_batch(&self, files: Vec<StagedFile>) -> BatchReport {
        let report = Arc::new(Mutex::new(BatchReport::default()));
        let mut tasks = JoinSet::new();

        for file in files {
            let pipeline = self.clone();
            let report = Arc::clone(&report);
            tasks.spawn(async move {
                match pipeline.upload_one(&file).await {
                    Ok(size) => {
                        info!(key = %file.object_key, size, "staged file uploaded");
                        pipeline.discard(&file.path).await;
                        report.lock().await.uploaded.push(file);
                    }
                    Err(err) => {
                        error!(
                            key = %file.object_key,
                            path = %file.path.display(),
                            error = %err,
                            "staged upload failed, keeping local copy"
                        );
                        report.lock().await.failed.push((file, err));
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "staged upload task panicked");
            }
        }

        let mut report = report.lock().await;
        std::mem::take(&mut *report)
    }

    async fn upload_one(&self, file: &StagedFile) -> Result<u64, String> {
        let source = File::open(&file.path)
            .await
            .map_err(|err| format!("opening {}: {err}", file.path.display()))?;
        let size = source
            .metadata()
            .await
            .map_err(|err| format!("reading size of {}: {err}", file.path.display()))?
            .len();
        self.engine
            .upload(&file.object_key, source, size)
            .await
            .map_err(|err| err.to_string())?;
        Ok(size)
    }

    /// Run a batch, record its failures in the ledger, and tell `owner_id` it
    /// finished.
    pub async fn process_staged(&self, files: Vec<StagedFile>, owner_id: Uuid) -> BatchReport {
        let count = files.len();
        let report = self.run_batch(files).await;
        if let Some(ledger) = &self.ledger {
            for (file, reason) in &report.failed {
                if let Err(err) = ledger.record_failure(file, reason).await {
                    error!(
                        key = %file.object_key,
                        path = %file.path.display(),
                        error = %err,
                        "could not record failed upload"
                    );
                }
            }
        }
        info!(
            owner = %owner_id,
            files = count,
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "staged batch finished"
        );
        self.sink.notify(owner_id, &report.summary());
        report
    }

    /// Start [`Self::process_staged`] in the background. The handle resolves
    /// to the batch report; [`Self::shutdown`] also waits for it.
    pub fn spawn_batch(&self, files: Vec<StagedFile>, owner_id: Uuid) -> JoinHandle<BatchReport> {
        let pipeline = self.clone();
        self.tracker
            .spawn(async move { pipeline.process_staged(files, owner_id).await })
    }

    /// Stop accepting batches and wait for the ones in flight.
    pub async fn shutdown(&self) {
        self.tracker.close();
        info!(in_flight = self.tracker.len(), "waiting for staged batches");
        self.tracker.wait().await;
    }
}

async fn sync_and_close(mut file: File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

//! Periodic maintenance: expiring share links and hard-deleting files whose
//! soft delete is older than the grace period.

use crate::services::{
    metadata::{MetadataError, MetadataStore},
    transfer::{TransferEngine, TransferError},
};
use chrono::{TimeDelta, Utc};
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct CleanupSchedule {
    pub link_sweep_interval: Duration,
    pub hard_delete_interval: Duration,
    pub hard_delete_grace: Duration,
}

/// Counts from one hard-delete sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
}

pub async fn sweep_links(metadata: &MetadataStore) -> Result<u64, MetadataError> {
    let purged = metadata.purge_expired_links(Utc::now()).await?;
    if purged > 0 {
        info!(purged, "expired shared links removed");
    }
    Ok(purged)
}

/// Remove the remote object and then the row of every file soft-deleted more
/// than `grace` ago. A file whose object cannot be removed keeps its row and
/// is retried on the next sweep.
pub async fn sweep_deleted(
    metadata: &MetadataStore,
    engine: &TransferEngine,
    grace: Duration,
) -> Result<SweepReport, MetadataError> {
    let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(grace)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    let due = metadata.due_for_hard_delete(cutoff).await?;

    let mut report = SweepReport::default();
    for file in due {
        match engine.delete(&file.object_key).await {
            Ok(()) | Err(TransferError::NotFound { .. }) => {}
            Err(err) => {
                error!(key = %file.object_key, error = %err, "failed to delete remote object");
                report.failed += 1;
                continue;
            }
        }
        match metadata.hard_delete(file.id).await {
            Ok(()) => {
                info!(id = %file.id, name = %file.file_name, "file deleted permanently");
                report.deleted += 1;
            }
            Err(err) => {
                error!(id = %file.id, error = %err, "failed to delete file record");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Start both sweepers. They exit when `cancel` fires.
pub fn spawn(
    metadata: MetadataStore,
    engine: TransferEngine,
    schedule: CleanupSchedule,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let links = {
        let metadata = metadata.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            info!(every_secs = schedule.link_sweep_interval.as_secs(), "starting link cleanup worker");
            let mut ticker = tokio::time::interval(schedule.link_sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_links(&metadata).await {
                            warn!(error = %err, "link sweep failed");
                        }
                    }
                }
            }
            info!("link cleanup worker stopped");
        })
    };

    let files = tokio::spawn(async move {
        info!(
            every_secs = schedule.hard_delete_interval.as_secs(),
            grace_secs = schedule.hard_delete_grace.as_secs(),
            "starting hard delete worker"
        );
        let mut ticker = tokio::time::interval(schedule.hard_delete_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep_deleted(&metadata, &engine, schedule.hard_delete_grace).await {
                        Ok(report) if report.failed > 0 => {
                            warn!(deleted = report.deleted, failed = report.failed, "hard delete sweep incomplete");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "hard delete sweep failed"),
                    }
                }
            }
        }
        info!("hard delete worker stopped");
    });

    vec![links, files]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{file::NewFile, link::SharedLink},
        services::{
            crypto::Codec,
            metadata::tests::memory_store,
            object_store::memory::{Call, MemoryStore},
        },
    };
    use bytes::Bytes;
    use std::sync::Arc;
    use uuid::Uuid;

    fn engine(store: &Arc<MemoryStore>) -> TransferEngine {
        let codec = Arc::new(Codec::new(&[5u8; 32]).unwrap());
        TransferEngine::new(store.clone(), codec, 1024, 2)
    }

    #[tokio::test]
    async fn sweep_deleted_removes_object_and_row_after_grace() {
        let metadata = memory_store().await;
        let store = Arc::new(MemoryStore::new());
        let file = metadata
            .insert_file(&NewFile::named(Uuid::new_v4(), "old.txt", 3))
            .await
            .unwrap();
        store.insert_object(&file.object_key, Bytes::from_static(b"abc"));
        metadata.soft_delete(file.id).await.unwrap();

        let report = sweep_deleted(&metadata, &engine(&store), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(report, SweepReport { deleted: 1, failed: 0 });
        assert!(store.object(&file.object_key).is_none());
        assert!(metadata.list_deleted(file.owner_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn files_inside_grace_are_left_alone() {
        let metadata = memory_store().await;
        let store = Arc::new(MemoryStore::new());
        let file = metadata
            .insert_file(&NewFile::named(Uuid::new_v4(), "recent.txt", 3))
            .await
            .unwrap();
        metadata.soft_delete(file.id).await.unwrap();

        let report = sweep_deleted(&metadata, &engine(&store), Duration::from_secs(120))
            .await
            .unwrap();

        assert_eq!(report, SweepReport::default());
        assert!(store.calls().is_empty());
        assert_eq!(metadata.list_deleted(file.owner_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn live_files_are_never_swept() {
        let metadata = memory_store().await;
        let store = Arc::new(MemoryStore::new());
        metadata
            .insert_file(&NewFile::named(Uuid::new_v4(), "keep.txt", 3))
            .await
            .unwrap();

        let report = sweep_deleted(&metadata, &engine(&store), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(report.deleted, 0);
        assert!(!store.calls().iter().any(|c| matches!(c, Call::Delete { .. })));
    }

    #[tokio::test]
    async fn sweep_links_drops_only_expired() {
        let metadata = memory_store().await;
        let file = metadata
            .insert_file(&NewFile::named(Uuid::new_v4(), "shared.txt", 3))
            .await
            .unwrap();
        for (token, offset) in [("stale", -5), ("live", 5)] {
            metadata
                .create_link(&SharedLink {
                    share_token: token.into(),
                    file_id: file.id,
                    object_key: file.object_key.clone(),
                    file_name: file.file_name.clone(),
                    expires_at: Utc::now() + TimeDelta::minutes(offset),
                })
                .await
                .unwrap();
        }

        assert_eq!(sweep_links(&metadata).await.unwrap(), 1);
        assert!(metadata.get_link("live").await.is_ok());
    }

    #[tokio::test]
    async fn workers_stop_when_cancelled() {
        let metadata = memory_store().await;
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let handles = spawn(
            metadata,
            engine(&store),
            CleanupSchedule {
                link_sweep_interval: Duration::from_secs(300),
                hard_delete_interval: Duration::from_secs(300),
                hard_delete_grace: Duration::from_secs(120),
            },
            cancel.clone(),
        );

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

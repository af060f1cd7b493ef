//! Service context shared by every handler.

use crate::{
    config::{AppConfig, ConfigError},
    services::{
        cache::{MemoryCache, TransferCache},
        cleanup::CleanupSchedule,
        crypto::Codec,
        links::LinkResolver,
        metadata::MetadataStore,
        notify::NotificationHub,
        object_store::ObjectStore,
        presign::UrlIssuer,
        staging::StagingPipeline,
        transfer::TransferEngine,
    },
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub metadata: MetadataStore,
    pub engine: TransferEngine,
    pub links: LinkResolver,
    pub staging: StagingPipeline,
    pub notifications: NotificationHub,
    pub share_ttl: Duration,
    pub public_base_url: String,
    pub cleanup: CleanupSchedule,
    /// Cancelled when the server starts shutting down. Long-lived responses
    /// and background workers stop on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the transfer core around `store` using the validated `cfg`.
    pub fn from_config(
        cfg: &AppConfig,
        store: Arc<dyn ObjectStore>,
        metadata: MetadataStore,
    ) -> Result<Self, ConfigError> {
        let codec = Codec::new(cfg.encryption_key.expose()).map_err(|err| ConfigError::Invalid {
            name: "FILEDROP_ENCRYPTION_KEY",
            reason: err.to_string(),
        })?;
        let engine = TransferEngine::new(
            Arc::clone(&store),
            Arc::new(codec),
            cfg.transfer.part_size,
            cfg.transfer.upload_concurrency,
        );

        let issuer = UrlIssuer::new(store, cfg.url_validity);
        let cache = TransferCache::new(Arc::new(MemoryCache::new()), cfg.cache_ttl, cfg.url_validity)?;
        let notifications = NotificationHub::new();
        let staging = StagingPipeline::new(
            cfg.staging_dir.clone(),
            engine.clone(),
            Arc::new(notifications.clone()),
        )
        .with_ledger(Arc::new(metadata.clone()));

        Ok(Self {
            metadata,
            links: LinkResolver::new(cache, issuer),
            engine,
            staging,
            notifications,
            share_ttl: cfg.share_ttl,
            public_base_url: cfg.public_base_url.clone(),
            cleanup: CleanupSchedule {
                link_sweep_interval: cfg.link_sweep_interval,
                hard_delete_interval: cfg.hard_delete_interval,
                hard_delete_grace: cfg.hard_delete_grace,
            },
            shutdown: CancellationToken::new(),
        })
    }
}

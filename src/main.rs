use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    cleanup, metadata::MetadataStore, object_store::S3ObjectStore, state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;
    tracing::info!(config = ?cfg, "starting filedrop");

    // --- Ensure staging directory exists ---
    if !cfg.staging_dir.exists() {
        tokio::fs::create_dir_all(&cfg.staging_dir)
            .await
            .with_context(|| format!("creating staging dir {}", cfg.staging_dir.display()))?;
        tracing::info!(path = %cfg.staging_dir.display(), "created staging directory");
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!(path = %parent.display(), "created database directory");
        }
    }
    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database url {}", cfg.database_url))?
        .create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("connecting to sqlite")?;
    let metadata = MetadataStore::new(db);

    // --- Handle migration mode ---
    metadata.migrate().await?;
    if migrate {
        tracing::info!("database migration complete");
        return Ok(()); // exit after migration
    }

    // --- Initialize transfer core ---
    let store = Arc::new(S3ObjectStore::connect(&cfg.s3).await);
    let state = AppState::from_config(&cfg, store, metadata)?;

    let cancel = state.shutdown.clone();
    let workers = cleanup::spawn(
        state.metadata.clone(),
        state.engine.clone(),
        state.cleanup,
        cancel.clone(),
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let on_signal = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // ends open event streams so serve can finish
            on_signal.cancel();
        })
        .await?;

    // --- Drain background work ---
    cancel.cancel();
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "cleanup worker ended abnormally");
        }
    }
    state.staging.shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

pub mod api;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod verdict_cache;

use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::ModerationConfig;
use crate::pipeline::dispatch::{AlertDispatcher, DispatchError, DispatchSettings};
use crate::pipeline::ocr::{build_ocr_engine, OcrWorkerPool};
use crate::pipeline::{IngestSettings, IngestionCoordinator, PolicyEngine};
use crate::verdict_cache::VerdictCache;

/// Startup failures. Anything after startup is handled per event.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] db::DatabaseError),

    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Assemble the pipeline from the environment, serve until Ctrl-C, then
/// drain alerts and release shared state.
pub async fn run() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = ModerationConfig::from_env()?;
    tracing::info!(
        backend = ?config.db_backend,
        fail_mode = ?config.fail_mode,
        ocr_workers = config.ocr_pool_size,
        ingest_concurrency = config.ingest_concurrency,
        webhook = config.webhook_url.is_some(),
        "Configuration loaded"
    );

    let repo = db::open_repository(&config)?;
    let cache = Arc::new(VerdictCache::new(config.cache_capacity, config.cache_ttl));
    let ocr = Arc::new(OcrWorkerPool::start(
        build_ocr_engine(),
        config.ocr_pool_size,
        config.ocr_queue_depth,
        config.ocr_timeout,
    ));
    let policy = Arc::new(PolicyEngine::with_default_rules());
    let dispatcher = Arc::new(AlertDispatcher::start(
        repo.clone(),
        DispatchSettings::from_config(&config),
    )?);

    // Alerts left pending by a previous run
    if let Err(e) = dispatcher.requeue_pending(&repo).await {
        tracing::warn!(error = %e, "Could not re-queue pending alerts");
    }

    let coordinator = Arc::new(IngestionCoordinator::new(
        repo,
        cache.clone(),
        ocr,
        policy,
        dispatcher.clone(),
        IngestSettings::from_config(&config),
    ));

    let server = api::start_api_server(
        api::ApiContext::new(coordinator, dispatcher.clone()),
        config.bind_addr,
    )
    .await?;
    tracing::info!(addr = %server.addr, "Accepting events");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down");
    server.shutdown().await;
    dispatcher.shutdown(config.shutdown_grace).await;

    let stats = cache.stats();
    tracing::info!(
        entries = stats.entries,
        hits = stats.hits,
        misses = stats.misses,
        evictions = stats.evictions,
        "Verdict cache released"
    );
    cache.clear();

    Ok(())
}

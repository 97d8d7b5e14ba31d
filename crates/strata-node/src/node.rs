//! Process wiring: storage, built-in extensions and the global context.

use std::sync::Arc;

use anyhow::{Context, Result};
use strata_engine::{DatasetStore, EngineConfig, ExtensionRegistry, GlobalContext, SqliteStore};
use tracing::info;

/// Opens storage and loads every persisted dataset.
pub async fn start(config: EngineConfig) -> Result<GlobalContext> {
    let store: Arc<dyn DatasetStore> = Arc::new(
        SqliteStore::connect(&config)
            .await
            .with_context(|| format!("failed to open storage at {}", config.database_url))?,
    );
    let registry = Arc::new(ExtensionRegistry::with_builtins());
    info!(extensions = ?registry.names(), "extension registry ready");

    let ctx = GlobalContext::new(registry, store, config).await?;
    Ok(ctx)
}

/// Runs until interrupted.
pub async fn run(config: EngineConfig) -> Result<()> {
    let ctx = start(config).await?;
    info!(
        datasets = ctx.list_datasets(None).len(),
        max_call_depth = ctx.config().max_call_depth,
        "node ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    Ok(())
}

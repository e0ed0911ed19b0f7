use anyhow::{Context, Result};
use bucket_sync::{
    backends::BackendRegistry,
    config::{AppConfig, RunMode, SyncConfig},
    services::{MetadataStore, SyncDriver, SyncEngine},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse CLI + env ---
    let app = AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if app.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if app.mode == RunMode::GenerateConfig {
        SyncConfig::generate_default(&app.config_path)?;
        info!("Wrote sample configuration to {}", app.config_path.display());
        return Ok(());
    }

    let mut config = SyncConfig::load(&app.config_path)
        .with_context(|| format!("loading configuration from {}", app.config_path.display()))?;
    if let Some(path) = &app.database_override {
        config.database_path = path.clone();
    }
    info!(
        providers = config.providers.len(),
        mappings = config.mappings.len(),
        concurrency = config.concurrency,
        "Starting bucket-sync with config {}",
        app.config_path.display()
    );

    // --- Metadata store ---
    let store = Arc::new(
        MetadataStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening metadata store {}", config.database_path.display()))?,
    );

    if app.mode == RunMode::Status {
        let result = print_status(&store, &config).await;
        store.close().await;
        return result;
    }

    // --- Providers ---
    let registry = match BackendRegistry::from_providers(&config.providers).await {
        Ok(registry) => registry,
        Err(err) => {
            store.close().await;
            return Err(err).context("initializing storage providers");
        }
    };

    let engine = SyncEngine::new(store.clone()).with_concurrency(config.concurrency);
    let driver = SyncDriver::new(registry, engine);

    // --- Shutdown wiring ---
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown requested, cancelling in-flight work");
            cancel.cancel();
        }
    });

    let result = match app.mode {
        RunMode::Periodic(interval) => run_periodic(&driver, &config, interval, &cancel).await,
        _ => run_once(&driver, &config, &cancel).await,
    };

    driver.registry().close_all().await;
    store.close().await;
    result
}

async fn run_once(
    driver: &SyncDriver,
    config: &SyncConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let summary = driver.sync_all(&config.mappings, cancel).await?;
    let failed = summary.failed().count();
    if failed > 0 {
        anyhow::bail!("{} of {} mappings failed", failed, summary.outcomes.len());
    }
    Ok(())
}

async fn run_periodic(
    driver: &SyncDriver,
    config: &SyncConfig,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Running sync every {}s", interval.as_secs());
    loop {
        let summary = driver.sync_all(&config.mappings, cancel).await?;
        let failed = summary.failed().count();
        if failed > 0 {
            warn!(failed, "Sync run finished with failed mappings");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Scheduler stopped");
    Ok(())
}

async fn print_status(store: &MetadataStore, config: &SyncConfig) -> Result<()> {
    println!(
        "metadata store {} (schema version {})",
        store.path().display(),
        store.schema_version().await?
    );
    for mapping in &config.mappings {
        let key = mapping.key();
        let counts = store
            .status_summary(&key)
            .await
            .with_context(|| format!("reading status of {}", key))?;
        if counts.is_empty() {
            println!("{}: no records", key);
            continue;
        }
        let line = counts
            .iter()
            .map(|(status, count)| format!("{}={}", status, count))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{}: {}", key, line);
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

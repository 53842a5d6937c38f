//! Keepsake ingestion server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use keepsake_core::config::AppConfig;
use keepsake_server::{AppState, create_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keepsake - photo and video backup ingestion
#[derive(Parser, Debug)]
#[command(name = "keepsaked")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "KEEPSAKE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Load configuration: the TOML file if present, then `KEEPSAKE_*`
/// environment variables. Missing settings fall back to defaults.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("KEEPSAKE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Keepsake v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    keepsake_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = keepsake_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend ready");

    let metadata = keepsake_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let state = AppState::new(config.clone(), storage, metadata);

    let dispatch_handle = state
        .coordinator
        .start()
        .await
        .context("failed to start import coordinator")?;
    let report = state
        .coordinator
        .recover_orphaned_jobs()
        .await
        .context("failed to recover orphaned import jobs")?;
    tracing::info!(
        requeued = report.requeued,
        failed = report.failed,
        "Orphaned import jobs recovered"
    );

    let _watchdog_handle = state.coordinator.spawn_watchdog();
    tracing::info!("Import task watchdog spawned");

    let housekeeping_handle = Arc::new(state.housekeeper()).spawn();
    tracing::info!(
        interval_secs = config.housekeeping.interval_secs,
        "Housekeeping task spawned"
    );

    let coordinator = state.coordinator.clone();
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    housekeeping_handle.abort();
    coordinator.shutdown().await;
    let _ = dispatch_handle.await;
    tracing::info!("Import jobs drained, exiting");

    Ok(())
}

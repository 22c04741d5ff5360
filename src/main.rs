//! Aqueduct Bridge Orchestrator - cross-chain TWAP execution daemon
//!
//! Splits large swap orders into timed intervals, prices them against
//! aggregated feeds, executes them through per-chain adapters, and
//! settles cross-chain legs with HTLC pairs.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use aqueduct::adapters::AdapterRegistry;
use aqueduct::api;
use aqueduct::config::Settings;
use aqueduct::metrics::MetricsServer;
use aqueduct::orchestrator::Orchestrator;
use aqueduct::store::{PostgresStore, Store};
use aqueduct::twap::{Engine, PriceCache, PriceFeedAggregator};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; logging verbosity depends on it
    let settings = Settings::load()?;
    init_logging(&settings);

    info!("starting Aqueduct Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        environment = %settings.orchestrator.environment,
        chains = settings.enabled_chains().len(),
        "configuration loaded"
    );

    // Store
    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&settings.database).await?);
    info!("database connection established");

    // Adapters
    let registry = Arc::new(AdapterRegistry::new(&settings)?);
    info!(chains = registry.chain_ids().len(), "chain adapters initialized");

    // Pricing
    let cache = Arc::new(PriceCache::new(settings.twap.price_max_age()));
    let sources = PriceFeedAggregator::sources_from_config(&settings.price_feeds)?;
    let aggregator = Arc::new(PriceFeedAggregator::new(
        sources,
        settings.twap.pairs.clone(),
        cache.clone(),
        store.clone(),
        settings.twap.feed_deadline(),
    ));

    // TWAP engine
    let engine = Arc::new(Engine::new(
        settings.twap.clone(),
        store.clone(),
        registry.clone(),
        cache,
        aggregator,
    ));

    // Orchestrator
    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        store.clone(),
        registry,
        engine,
    ));
    orchestrator.start().await?;

    // API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let orchestrator = orchestrator.clone();
        let store = store.clone();
        async move {
            if let Err(e) = api::run_server(config, orchestrator, store).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!(
        "API server: http://{}:{}",
        settings.api.host, settings.api.port
    );
    if settings.metrics.enabled {
        info!("metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("shutdown signal received, stopping...");

    // Orchestrator stops engine, monitors, and adapters; store goes last
    orchestrator.stop().await;
    api_handle.abort();
    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    store.close().await;

    info!("Aqueduct Orchestrator stopped");
    Ok(())
}

fn init_logging(settings: &Settings) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_filter = if settings.is_production() {
        "info,aqueduct=info,sqlx=warn,hyper=warn"
    } else {
        "info,aqueduct=debug,sqlx=warn,hyper=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

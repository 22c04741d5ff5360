//! HTTP monitoring surface: liveness, readiness, status
//!
//! The order-facing REST/WebSocket API lives in a separate service; this
//! is only the operational endpoint set.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::adapters::ChainStatusInfo;
use crate::config::ApiConfig;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn Store>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn Store>,
) -> Result<()> {
    let state = AppState {
        orchestrator,
        store,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::Internal(format!("api bind failed: {}", e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| OrchestratorError::Internal(format!("api server failed: {}", e)))?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Liveness: the process is up
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: Vec<ChainReadiness>,
}

#[derive(Serialize)]
struct ChainReadiness {
    chain_id: String,
    healthy: bool,
}

/// Readiness: the store and every chain answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health().await.is_ok();
    let chain_health = state.orchestrator.registry().health_check_all().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let response = ReadinessResponse {
        ready: database && chains_ok,
        database,
        chains: chain_health
            .into_iter()
            .map(|(chain_id, healthy)| ChainReadiness { chain_id, healthy })
            .collect(),
    };

    let code = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Full health aggregate: store, adapters, statistics, engine metrics
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.health_check().await)
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainStatusInfo>,
}

async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        chains: state.orchestrator.registry().chain_statuses().await,
    })
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.statistics().await)
}

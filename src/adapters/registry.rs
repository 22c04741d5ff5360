//! Adapter registry - owns all chain adapters and the event bus

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::bitcoin::BitcoinAdapter;
use super::cosmos::CosmosAdapter;
use super::evm::EvmAdapter;
use super::stellar::StellarAdapter;
use super::types::{
    ChainEvent, ChainStatusInfo, CreateHtlcParams, CrossChainSwapParams, CrossChainSwapResult,
};
use super::ChainAdapter;
use crate::config::{ChainKind, Settings};
use crate::error::{OrchestratorError, Result};
use crate::metrics;

/// Safety margins between the source and target HTLC timeouts. The target
/// side must expire strictly earlier so the secret revealer cannot be
/// raced on the source leg.
const HTLC_TIME_MARGIN_SECS: i64 = 3600;
const HTLC_HEIGHT_MARGIN: u64 = 100;

/// A paired HTLC creation that failed on the target leg. The source lock
/// already exists on-chain; the caller must persist it so the refund
/// monitor can reclaim it after its timeout.
#[derive(Debug, Error)]
pub enum HtlcPairError {
    #[error("source HTLC creation failed: {0}")]
    Source(OrchestratorError),

    #[error("target HTLC creation failed after source lock {source_htlc}: {cause}")]
    Target {
        source_htlc: String,
        cause: OrchestratorError,
    },

    #[error("{0}")]
    Invalid(OrchestratorError),
}

/// Manages adapters for all configured chains
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn ChainAdapter>>,
    event_tx: broadcast::Sender<ChainEvent>,
}

impl AdapterRegistry {
    /// Create adapters for every supported and enabled chain
    pub fn new(settings: &Settings) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(10_000);
        let adapters: DashMap<String, Arc<dyn ChainAdapter>> = DashMap::new();

        for (chain_id, chain_config) in settings.enabled_chains() {
            let adapter: Arc<dyn ChainAdapter> = match chain_config.kind {
                ChainKind::Evm => Arc::new(EvmAdapter::new(chain_id, chain_config)?),
                ChainKind::Cosmos => Arc::new(CosmosAdapter::new(chain_id, chain_config)?),
                ChainKind::Stellar => Arc::new(StellarAdapter::new(chain_id, chain_config)?),
                ChainKind::Bitcoin => Arc::new(BitcoinAdapter::new(chain_id, chain_config)?),
            };
            info!(chain_id = %chain_id, name = %chain_config.name, "adapter created");
            adapters.insert(chain_id.clone(), adapter);
        }

        Ok(Self { adapters, event_tx })
    }

    /// Build a registry over pre-constructed adapters (tests)
    pub fn with_adapters(adapters: Vec<Arc<dyn ChainAdapter>>) -> Self {
        let (event_tx, _) = broadcast::channel(10_000);
        let map = DashMap::new();
        for adapter in adapters {
            map.insert(adapter.chain_id().to_string(), adapter);
        }
        Self {
            adapters: map,
            event_tx,
        }
    }

    pub fn adapter(&self, chain_id: &str) -> Result<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(chain_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("adapter for chain {}", chain_id)))
    }

    pub fn chain_ids(&self) -> Vec<String> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_supported(&self, chain_id: &str) -> bool {
        self.adapters.contains_key(chain_id)
    }

    /// Subscribe to the merged event stream of all chains
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.event_tx.subscribe()
    }

    /// Connect every adapter; fails if any chain cannot be reached
    pub async fn connect_all(&self) -> Result<()> {
        let entries: Vec<(String, Arc<dyn ChainAdapter>)> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut failures = 0;
        for (chain_id, adapter) in entries {
            match adapter.connect().await {
                Ok(()) => {
                    info!(chain_id = %chain_id, "adapter connected");
                    metrics::record_chain_connected(&chain_id, true);
                }
                Err(e) => {
                    error!(chain_id = %chain_id, error = %e, "failed to connect adapter");
                    metrics::record_chain_connected(&chain_id, false);
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(OrchestratorError::Chain {
                chain_id: "*".into(),
                message: format!("failed to connect {} adapters", failures),
            });
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let entries: Vec<(String, Arc<dyn ChainAdapter>)> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (chain_id, adapter) in entries {
            if let Err(e) = adapter.disconnect().await {
                error!(chain_id = %chain_id, error = %e, "failed to disconnect adapter");
            } else {
                info!(chain_id = %chain_id, "adapter disconnected");
            }
            metrics::record_chain_connected(&chain_id, false);
        }
    }

    /// Point every adapter's event pump at the shared bus
    pub async fn subscribe_all(&self) -> Result<()> {
        let entries: Vec<Arc<dyn ChainAdapter>> =
            self.adapters.iter().map(|e| e.value().clone()).collect();
        for adapter in entries {
            adapter.subscribe(self.event_tx.clone()).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_all(&self) {
        let entries: Vec<(String, Arc<dyn ChainAdapter>)> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (chain_id, adapter) in entries {
            if let Err(e) = adapter.unsubscribe().await {
                warn!(chain_id = %chain_id, error = %e, "failed to unsubscribe adapter");
            }
        }
    }

    /// Health-check every adapter; returns (chain_id, healthy) pairs
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let entries: Vec<(String, Arc<dyn ChainAdapter>)> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut results = Vec::new();
        for (chain_id, adapter) in entries {
            let healthy = match adapter.chain_status().await {
                Ok(status) => status.healthy,
                Err(_) => false,
            };
            metrics::record_chain_connected(&chain_id, healthy);
            results.push((chain_id, healthy));
        }
        results
    }

    /// Current status of every chain, keyed by chain id
    pub async fn chain_statuses(&self) -> Vec<ChainStatusInfo> {
        let entries: Vec<(String, Arc<dyn ChainAdapter>)> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut statuses = Vec::new();
        for (chain_id, adapter) in entries {
            match adapter.chain_status().await {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(chain_id = %chain_id, error = %e, "failed to read chain status")
                }
            }
        }
        statuses
    }

    /// Create the HTLC pair backing a cross-chain swap.
    ///
    /// The source lock is created first with the caller's timeouts; the
    /// target lock gets timeouts shortened by the safety margins so the
    /// recipient must claim (revealing the secret) while the source lock
    /// is still claimable.
    pub async fn create_htlc_pair(
        &self,
        params: &CrossChainSwapParams,
    ) -> std::result::Result<CrossChainSwapResult, HtlcPairError> {
        let source = self
            .adapter(&params.source_chain)
            .map_err(HtlcPairError::Invalid)?;
        let target = self
            .adapter(&params.target_chain)
            .map_err(HtlcPairError::Invalid)?;

        if params.timeout_height <= HTLC_HEIGHT_MARGIN {
            return Err(HtlcPairError::Invalid(OrchestratorError::Validation(
                format!(
                    "timeout_height {} leaves no room for the {}-block target margin",
                    params.timeout_height, HTLC_HEIGHT_MARGIN
                ),
            )));
        }
        let target_timestamp = params.timeout_timestamp - HTLC_TIME_MARGIN_SECS;
        if target_timestamp <= chrono::Utc::now().timestamp() {
            return Err(HtlcPairError::Invalid(OrchestratorError::Validation(
                "timeout_timestamp leaves no room for the 1h target margin".into(),
            )));
        }

        let source_htlc = source
            .create_htlc(&CreateHtlcParams {
                order_id: params.order_id.clone(),
                hashed_secret: params.hashed_secret.clone(),
                amount: params.amount,
                token: params.source_token.clone(),
                recipient: params.target_recipient.clone(),
                timeout_height: params.timeout_height,
                timeout_timestamp: params.timeout_timestamp,
            })
            .await
            .map_err(HtlcPairError::Source)?;

        info!(
            order_id = %params.order_id,
            source_htlc = %source_htlc,
            chain_id = %params.source_chain,
            "source HTLC created"
        );

        let target_htlc = target
            .create_htlc(&CreateHtlcParams {
                order_id: params.order_id.clone(),
                hashed_secret: params.hashed_secret.clone(),
                amount: params.target_amount,
                token: params.target_token.clone(),
                recipient: params.source_user.clone(),
                timeout_height: params.timeout_height - HTLC_HEIGHT_MARGIN,
                timeout_timestamp: target_timestamp,
            })
            .await
            .map_err(|cause| {
                error!(
                    order_id = %params.order_id,
                    source_htlc = %source_htlc,
                    error = %cause,
                    "target HTLC creation failed; source lock awaits refund after timeout"
                );
                HtlcPairError::Target {
                    source_htlc: source_htlc.clone(),
                    cause,
                }
            })?;

        metrics::record_cross_chain_swap();

        Ok(CrossChainSwapResult {
            source_htlc,
            target_htlc,
            source_chain: params.source_chain.clone(),
            target_chain: params.target_chain.clone(),
            created_at: chrono::Utc::now(),
        })
    }
}

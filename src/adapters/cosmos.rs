//! Cosmos chain adapter
//!
//! Height and health come from the Tendermint RPC `/status` endpoint;
//! balances from the LCD REST API; the TWAP/HTLC planes go through the
//! chain's signing gateway.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use super::gateway::{GatewayClient, GatewayPump};
use super::types::{
    ChainEvent, ChainStatusInfo, CreateHtlcParams, CreateTwapOrderParams, ExecuteIntervalParams,
    ExecutionOutcome, HtlcState,
};
use super::ChainAdapter;
use crate::config::ChainConfig;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Deserialize)]
struct TendermintStatus {
    result: TendermintStatusResult,
}

#[derive(Debug, Deserialize)]
struct TendermintStatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: String,
    latest_block_time: DateTime<Utc>,
    catching_up: bool,
}

#[derive(Debug, Deserialize)]
struct BankBalance {
    balance: Coin,
}

#[derive(Debug, Deserialize)]
struct Coin {
    amount: String,
}

pub struct CosmosAdapter {
    chain_id: String,
    name: String,
    config: ChainConfig,
    http: reqwest::Client,
    gateway: Arc<GatewayClient>,
    connected: RwLock<bool>,
    pump: RwLock<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl CosmosAdapter {
    pub fn new(chain_id: &str, config: &ChainConfig) -> Result<Self> {
        let gateway_url = config
            .gateway_url
            .as_deref()
            .ok_or_else(|| OrchestratorError::Config(format!("{}: missing gateway_url", chain_id)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            chain_id: chain_id.to_string(),
            name: config.name.clone(),
            config: config.clone(),
            http,
            gateway: Arc::new(GatewayClient::new(chain_id, gateway_url)?),
            connected: RwLock::new(false),
            pump: RwLock::new(None),
        })
    }

    fn chain_error(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::Chain {
            chain_id: self.chain_id.clone(),
            message: message.into(),
        }
    }

    async fn node_status(&self) -> Result<SyncInfo> {
        let url = format!("{}/status", self.config.rpc_url.trim_end_matches('/'));
        let status: TendermintStatus = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("status query failed: {}", e)))?
            .json()
            .await
            .map_err(|e| self.chain_error(format!("bad status body: {}", e)))?;
        Ok(status.result.sync_info)
    }
}

#[async_trait]
impl ChainAdapter for CosmosAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let sync = self.node_status().await?;
        if sync.catching_up {
            return Err(self.chain_error("node is still catching up"));
        }
        *self.connected.write().await = true;
        debug!(chain_id = %self.chain_id, height = %sync.latest_block_height, "cosmos adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.unsubscribe().await?;
        *self.connected.write().await = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    async fn address(&self) -> Result<String> {
        if let Some(address) = &self.config.account_address {
            return Ok(address.clone());
        }
        self.gateway.operator_address().await
    }

    async fn balance(&self, token: &str) -> Result<U256> {
        let rest = self
            .config
            .rest_url
            .as_deref()
            .ok_or_else(|| OrchestratorError::Config(format!("{}: missing rest_url", self.chain_id)))?;
        let address = self.address().await?;
        let url = format!(
            "{}/cosmos/bank/v1beta1/balances/{}/by_denom?denom={}",
            rest.trim_end_matches('/'),
            address,
            token
        );
        let balance: BankBalance = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("balance query failed: {}", e)))?
            .json()
            .await
            .map_err(|e| self.chain_error(format!("bad balance body: {}", e)))?;
        U256::from_dec_str(&balance.balance.amount)
            .map_err(|e| self.chain_error(format!("bad balance amount: {}", e)))
    }

    async fn create_twap_order(&self, params: &CreateTwapOrderParams) -> Result<String> {
        self.gateway.create_order(params).await
    }

    async fn execute_twap_interval(
        &self,
        params: &ExecuteIntervalParams,
    ) -> Result<ExecutionOutcome> {
        self.gateway.execute_interval(params).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.gateway.cancel_order(order_id).await
    }

    async fn create_htlc(&self, params: &CreateHtlcParams) -> Result<String> {
        self.gateway.create_htlc(params).await
    }

    async fn claim_htlc(&self, htlc_address: &str, secret: &str) -> Result<String> {
        self.gateway.claim_htlc(htlc_address, secret).await
    }

    async fn refund_htlc(&self, htlc_address: &str) -> Result<String> {
        self.gateway.refund_htlc(htlc_address).await
    }

    async fn htlc_status(&self, htlc_address: &str) -> Result<HtlcState> {
        self.gateway.htlc_state(htlc_address).await
    }

    async fn current_price(&self, _token_pair: &str) -> Result<Option<U256>> {
        // No native oracle; the aggregator is authoritative.
        Ok(None)
    }

    async fn twap_price(&self, _token_pair: &str, _window_minutes: u32) -> Result<Option<U256>> {
        Ok(None)
    }

    async fn subscribe(&self, sink: broadcast::Sender<ChainEvent>) -> Result<()> {
        let mut pump = self.pump.write().await;
        if pump.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = GatewayPump {
            chain_id: self.chain_id.clone(),
            gateway: self.gateway.clone(),
            poll_interval: Duration::from_secs(self.config.event_poll_secs),
            sink,
            stop: stop_rx,
        };
        let handle = tokio::spawn(task.run());
        *pump = Some((stop_tx, handle));
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        if let Some((stop, handle)) = self.pump.write().await.take() {
            let _ = stop.send(true);
            handle.abort();
        }
        Ok(())
    }

    async fn chain_status(&self) -> Result<ChainStatusInfo> {
        let sync = self.node_status().await?;
        let height = sync
            .latest_block_height
            .parse::<u64>()
            .map_err(|e| self.chain_error(format!("bad block height: {}", e)))?;

        Ok(ChainStatusInfo {
            chain_id: self.chain_id.clone(),
            name: self.name.clone(),
            healthy: !sync.catching_up,
            last_block_height: height,
            last_block_time: Some(sync.latest_block_time),
            avg_block_time: Some("6s".to_string()),
            gas_price: None,
            checked_at: Utc::now(),
        })
    }
}

//! Stellar chain adapter
//!
//! Ledger height and health come from the Horizon root document, balances
//! from the account endpoint (lumens carry 7 decimal places); the
//! TWAP/HTLC planes go through the chain's signing gateway.

use async_trait::async_trait;
use chrono::Utc;
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
use crate::model::parse_fixed;

const STELLAR_DECIMALS: u32 = 7;

#[derive(Debug, Deserialize)]
struct HorizonRoot {
    history_latest_ledger: u64,
    horizon_version: String,
}

#[derive(Debug, Deserialize)]
struct HorizonAccount {
    balances: Vec<HorizonBalance>,
}

#[derive(Debug, Deserialize)]
struct HorizonBalance {
    balance: String,
    asset_type: String,
    #[serde(default)]
    asset_code: Option<String>,
}

pub struct StellarAdapter {
    chain_id: String,
    name: String,
    config: ChainConfig,
    http: reqwest::Client,
    gateway: Arc<GatewayClient>,
    connected: RwLock<bool>,
    pump: RwLock<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl StellarAdapter {
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

    async fn horizon_root(&self) -> Result<HorizonRoot> {
        let url = self.config.rpc_url.trim_end_matches('/').to_string();
        self.http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.chain_error(format!("horizon query failed: {}", e)))?
            .json()
            .await
            .map_err(|e| self.chain_error(format!("bad horizon body: {}", e)))
    }
}

#[async_trait]
impl ChainAdapter for StellarAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let root = self.horizon_root().await?;
        *self.connected.write().await = true;
        debug!(
            chain_id = %self.chain_id,
            ledger = root.history_latest_ledger,
            horizon = %root.horizon_version,
            "stellar adapter connected"
        );
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
        let address = self.address().await?;
        let url = format!(
            "{}/accounts/{}",
            self.config.rpc_url.trim_end_matches('/'),
            address
        );
        let account: HorizonAccount = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("account query failed: {}", e)))?
            .json()
            .await
            .map_err(|e| self.chain_error(format!("bad account body: {}", e)))?;

        let entry = account
            .balances
            .iter()
            .find(|b| {
                if token.is_empty() || token == "native" || token == "XLM" {
                    b.asset_type == "native"
                } else {
                    b.asset_code.as_deref() == Some(token)
                }
            })
            .ok_or_else(|| self.chain_error(format!("no balance entry for {}", token)))?;

        parse_fixed(&entry.balance, STELLAR_DECIMALS)
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
        let root = self.horizon_root().await?;
        Ok(ChainStatusInfo {
            chain_id: self.chain_id.clone(),
            name: self.name.clone(),
            healthy: true,
            last_block_height: root.history_latest_ledger,
            last_block_time: None,
            avg_block_time: Some("5s".to_string()),
            gas_price: None,
            checked_at: Utc::now(),
        })
    }
}

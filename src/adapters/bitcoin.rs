//! Bitcoin chain adapter
//!
//! Height and health come from bitcoind's JSON-RPC (`getblockchaininfo`);
//! wallet balance via `getbalance`, converted lexically from BTC to
//! satoshis. HTLCs on Bitcoin are script-based and are driven, like the
//! TWAP plane, through the chain's signing gateway.

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::U256;
use serde::Deserialize;
use serde_json::{json, Value};
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

const BTC_DECIMALS: u32 = 8;

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    blocks: u64,
    #[serde(rename = "initialblockdownload", default)]
    initial_block_download: bool,
    #[serde(rename = "mediantime", default)]
    median_time: i64,
}

pub struct BitcoinAdapter {
    chain_id: String,
    name: String,
    config: ChainConfig,
    http: reqwest::Client,
    gateway: Arc<GatewayClient>,
    connected: RwLock<bool>,
    pump: RwLock<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl BitcoinAdapter {
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

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let mut request = self.http.post(&self.config.rpc_url).json(&json!({
            "jsonrpc": "1.0",
            "id": "aqueduct",
            "method": method,
            "params": params,
        }));
        if let Some(user) = &self.config.rpc_user {
            let password = self
                .config
                .rpc_password_env
                .as_deref()
                .and_then(|env| std::env::var(env).ok())
                .unwrap_or_default();
            request = request.basic_auth(user, Some(password));
        }

        let envelope: RpcEnvelope = request
            .send()
            .await
            .map_err(|e| self.chain_error(format!("{} failed: {}", method, e)))?
            .json()
            .await
            .map_err(|e| self.chain_error(format!("{} bad body: {}", method, e)))?;

        if let Some(error) = envelope.error {
            if !error.is_null() {
                return Err(self.chain_error(format!("{} error: {}", method, error)));
            }
        }
        envelope
            .result
            .ok_or_else(|| self.chain_error(format!("{} returned no result", method)))
    }

    async fn blockchain_info(&self) -> Result<BlockchainInfo> {
        let result = self.rpc("getblockchaininfo", json!([])).await?;
        serde_json::from_value(result)
            .map_err(|e| self.chain_error(format!("bad getblockchaininfo result: {}", e)))
    }
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let info = self.blockchain_info().await?;
        if info.initial_block_download {
            return Err(self.chain_error("node is in initial block download"));
        }
        *self.connected.write().await = true;
        debug!(chain_id = %self.chain_id, height = info.blocks, "bitcoin adapter connected");
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

    async fn balance(&self, _token: &str) -> Result<U256> {
        let result = self.rpc("getbalance", json!([])).await?;
        // The node reports BTC as a JSON number; go through its literal
        // representation so no float arithmetic touches the amount.
        let literal = match &result {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => {
                return Err(self.chain_error(format!("unexpected getbalance result: {}", other)))
            }
        };
        parse_fixed(&literal, BTC_DECIMALS)
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
        let info = self.blockchain_info().await?;
        Ok(ChainStatusInfo {
            chain_id: self.chain_id.clone(),
            name: self.name.clone(),
            healthy: !info.initial_block_download,
            last_block_height: info.blocks,
            last_block_time: chrono::TimeZone::timestamp_opt(&Utc, info.median_time, 0).single(),
            avg_block_time: Some("600s".to_string()),
            gas_price: None,
            checked_at: Utc::now(),
        })
    }
}

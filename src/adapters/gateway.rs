//! Shared client for chain signing gateways
//!
//! Non-EVM chains are driven through a per-chain gateway service that owns
//! the chain's wallet stack and exposes the TWAP/HTLC planes over REST.
//! The node's native API is still used read-only for height and health
//! (see the per-chain adapters).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::types::{
    ChainEvent, CreateHtlcParams, CreateTwapOrderParams, EventType, ExecuteIntervalParams,
    ExecutionOutcome, HtlcState,
};
use crate::error::{OrchestratorError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct OrderCreatedResponse {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct HtlcCreatedResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    secret: &'a str,
}

/// One event as delivered by a gateway's cursor feed
#[derive(Debug, Deserialize)]
pub struct GatewayEvent {
    pub event_type: EventType,
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct EventPage {
    pub events: Vec<GatewayEvent>,
    pub cursor: u64,
}

pub struct GatewayClient {
    chain_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(chain_id: &str, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            chain_id: chain_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn chain_error(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::Chain {
            chain_id: self.chain_id.clone(),
            message: message.into(),
        }
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("GET {} failed: {}", path, e)))?;
        if !response.status().is_success() {
            return Err(self.chain_error(format!("GET {} returned {}", path, response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| self.chain_error(format!("GET {} bad body: {}", path, e)))
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(&self, path: &str, body: &T) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("POST {} failed: {}", path, e)))?;
        if !response.status().is_success() {
            return Err(self.chain_error(format!("POST {} returned {}", path, response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| self.chain_error(format!("POST {} bad body: {}", path, e)))
    }

    pub async fn operator_address(&self) -> Result<String> {
        let response: AddressResponse = self.get_json("/v1/address").await?;
        Ok(response.address)
    }

    pub async fn create_order(&self, params: &CreateTwapOrderParams) -> Result<String> {
        let response: OrderCreatedResponse = self.post_json("/v1/orders", params).await?;
        Ok(response.order_id)
    }

    pub async fn execute_interval(
        &self,
        params: &ExecuteIntervalParams,
    ) -> Result<ExecutionOutcome> {
        self.post_json(
            &format!("/v1/orders/{}/intervals", params.order_id),
            params,
        )
        .await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/v1/orders/{}", self.base_url, order_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("cancel failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(self.chain_error(format!("cancel returned {}", response.status())));
        }
        Ok(())
    }

    pub async fn create_htlc(&self, params: &CreateHtlcParams) -> Result<String> {
        let response: HtlcCreatedResponse = self.post_json("/v1/htlcs", params).await?;
        Ok(response.address)
    }

    pub async fn claim_htlc(&self, address: &str, secret: &str) -> Result<String> {
        let response: TxResponse = self
            .post_json(&format!("/v1/htlcs/{}/claim", address), &ClaimRequest { secret })
            .await?;
        Ok(response.tx_hash)
    }

    pub async fn refund_htlc(&self, address: &str) -> Result<String> {
        let response: TxResponse = self
            .post_json(&format!("/v1/htlcs/{}/refund", address), &Value::Null)
            .await?;
        Ok(response.tx_hash)
    }

    pub async fn htlc_state(&self, address: &str) -> Result<HtlcState> {
        self.get_json(&format!("/v1/htlcs/{}", address)).await
    }

    pub async fn events(&self, after: u64) -> Result<EventPage> {
        self.get_json(&format!("/v1/events?after={}&limit=100", after))
            .await
    }
}

/// Polls a gateway's event feed and republishes onto the shared bus
pub struct GatewayPump {
    pub chain_id: String,
    pub gateway: std::sync::Arc<GatewayClient>,
    pub poll_interval: Duration,
    pub sink: broadcast::Sender<ChainEvent>,
    pub stop: watch::Receiver<bool>,
}

impl GatewayPump {
    pub async fn run(mut self) {
        let mut cursor = 0u64;
        loop {
            if *self.stop.borrow() {
                break;
            }
            tokio::select! {
                _ = self.stop.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.gateway.events(cursor).await {
                Ok(page) => {
                    for event in page.events {
                        let _ = self.sink.send(ChainEvent {
                            chain_id: self.chain_id.clone(),
                            event_type: event.event_type,
                            block_number: event.block_number,
                            tx_hash: event.tx_hash,
                            timestamp: event.timestamp,
                            data: event.data,
                            log_index: None,
                        });
                    }
                    cursor = page.cursor;
                }
                Err(e) => {
                    warn!(chain_id = %self.chain_id, error = %e, "gateway event poll failed");
                }
            }
        }
        debug!(chain_id = %self.chain_id, "gateway event pump stopped");
    }
}

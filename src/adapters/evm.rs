//! EVM chain adapter
//!
//! Talks to Ethereum-like chains through an ethers provider with a local
//! signer. Bridge and HTLC interactions go through typed contract
//! bindings; events are picked up by a polling pump over contract logs.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::prelude::*;
use ethers::utils::keccak256;
use lazy_static::lazy_static;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::types::{
    ChainEvent, ChainStatusInfo, CreateHtlcParams, CreateTwapOrderParams, EventType,
    ExecuteIntervalParams, ExecutionOutcome, HtlcState,
};
use super::ChainAdapter;
use crate::config::ChainConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{money::PRICE_DECIMALS, HtlcStatus};

abigen!(
    TwapBridge,
    r#"[
        function createOrder(bytes32 orderId, address user, uint256 amount, uint256 minReceived, uint32 windowMinutes, uint32 intervals, uint32 maxSlippageBps, bytes32 hashedSecret, uint64 timeoutHeight, uint64 timeoutTimestamp)
        function executeInterval(bytes32 orderId, uint32 intervalNumber, uint256 amount, uint32 maxSlippageBps, uint256 priceHint) returns (uint256 executedAmount, uint256 executionPrice)
        function cancelOrder(bytes32 orderId)
    ]"#
);

abigen!(
    HtlcVault,
    r#"[
        function newLock(bytes32 hashedSecret, address token, uint256 amount, address recipient, uint64 timeoutHeight, uint64 timeoutTimestamp) returns (address)
        function claim(address lock, bytes32 secret)
        function refund(address lock)
        function lockState(address lock) view returns (bytes32 hashedSecret, uint256 amount, address token, address sender, address recipient, uint64 timeoutHeight, uint64 timeoutTimestamp, uint8 status, uint256 createdAt, bytes32 secret)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) view returns (uint256)
    ]"#
);

abigen!(
    AggregatorV3,
    r#"[
        function latestRoundData() view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)
        function decimals() view returns (uint8)
    ]"#
);

lazy_static! {
    static ref TOPIC_ORDER_CREATED: H256 =
        H256::from(keccak256(b"OrderCreated(bytes32,address,uint256)"));
    static ref TOPIC_INTERVAL_EXECUTED: H256 =
        H256::from(keccak256(b"IntervalExecuted(bytes32,uint32,uint256,uint256)"));
    static ref TOPIC_ORDER_COMPLETED: H256 = H256::from(keccak256(b"OrderCompleted(bytes32)"));
    static ref TOPIC_ORDER_CANCELLED: H256 = H256::from(keccak256(b"OrderCancelled(bytes32)"));
    static ref TOPIC_LOCK_CREATED: H256 =
        H256::from(keccak256(b"LockCreated(address,bytes32,uint256)"));
    static ref TOPIC_LOCK_CLAIMED: H256 = H256::from(keccak256(b"LockClaimed(address,bytes32)"));
    static ref TOPIC_LOCK_REFUNDED: H256 = H256::from(keccak256(b"LockRefunded(address)"));
}

type EvmClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EvmAdapter {
    chain_id: String,
    name: String,
    config: ChainConfig,
    provider: Arc<Provider<Http>>,
    bridge_address: Address,
    htlc_address: Address,
    client: RwLock<Option<Arc<EvmClient>>>,
    pump: RwLock<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl EvmAdapter {
    pub fn new(chain_id: &str, config: &ChainConfig) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str()).map_err(|e| {
            OrchestratorError::Config(format!("invalid RPC URL for {}: {}", chain_id, e))
        })?;

        let bridge_address = parse_address(
            config.bridge_address.as_deref().unwrap_or_default(),
            chain_id,
            "bridge_address",
        )?;
        let htlc_address = parse_address(
            config.htlc_address.as_deref().unwrap_or_default(),
            chain_id,
            "htlc_address",
        )?;

        Ok(Self {
            chain_id: chain_id.to_string(),
            name: config.name.clone(),
            config: config.clone(),
            provider: Arc::new(provider),
            bridge_address,
            htlc_address,
            client: RwLock::new(None),
            pump: RwLock::new(None),
        })
    }

    async fn client(&self) -> Result<Arc<EvmClient>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| self.chain_error("adapter not connected"))
    }

    fn chain_error(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::Chain {
            chain_id: self.chain_id.clone(),
            message: message.into(),
        }
    }

    fn bridge(&self, client: Arc<EvmClient>) -> TwapBridge<EvmClient> {
        TwapBridge::new(self.bridge_address, client)
    }

    fn vault(&self, client: Arc<EvmClient>) -> HtlcVault<EvmClient> {
        HtlcVault::new(self.htlc_address, client)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let network_id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| self.chain_error(format!("failed to query chain id: {}", e)))?;

        let key_env = self
            .config
            .private_key_env
            .as_deref()
            .ok_or_else(|| OrchestratorError::Config("missing private_key_env".into()))?;
        let key = std::env::var(key_env)
            .map_err(|_| OrchestratorError::Config(format!("env var {} not set", key_env)))?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| OrchestratorError::Config(format!("invalid signer key: {}", e)))?
            .with_chain_id(network_id.as_u64());

        let client = SignerMiddleware::new((*self.provider).clone(), wallet);
        *self.client.write().await = Some(Arc::new(client));
        debug!(chain_id = %self.chain_id, network_id = %network_id, "EVM adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.unsubscribe().await?;
        *self.client.write().await = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    async fn address(&self) -> Result<String> {
        let client = self.client().await?;
        Ok(format!("{:?}", client.signer().address()))
    }

    async fn balance(&self, token: &str) -> Result<U256> {
        let client = self.client().await?;
        let owner = client.signer().address();
        if token.is_empty() || token == "native" {
            return self
                .provider
                .get_balance(owner, None)
                .await
                .map_err(|e| self.chain_error(format!("balance query failed: {}", e)));
        }
        let token_address = parse_address(token, &self.chain_id, "token")?;
        Erc20::new(token_address, client)
            .balance_of(owner)
            .call()
            .await
            .map_err(|e| self.chain_error(format!("balanceOf failed: {}", e)))
    }

    async fn create_twap_order(&self, params: &CreateTwapOrderParams) -> Result<String> {
        let client = self.client().await?;
        let order_id = order_id_bytes(&params.order_id)?;
        let hashed_secret = bytes32(&params.hashed_secret)?;
        let user = parse_address(&params.user_address, &self.chain_id, "user_address")?;

        let call = self.bridge(client).create_order(
            order_id,
            user,
            params.amount,
            params.min_received,
            params.window_minutes,
            params.intervals,
            params.max_slippage_bps,
            hashed_secret,
            params.timeout_height,
            params.timeout_timestamp as u64,
        );
        let pending = call
            .send()
            .await
            .map_err(|e| self.chain_error(format!("createOrder reverted: {}", e)))?;
        pending
            .await
            .map_err(|e| self.chain_error(format!("createOrder not mined: {}", e)))?;
        Ok(params.order_id.clone())
    }

    async fn execute_twap_interval(
        &self,
        params: &ExecuteIntervalParams,
    ) -> Result<ExecutionOutcome> {
        let client = self.client().await?;
        let order_id = order_id_bytes(&params.order_id)?;
        let call = self.bridge(client).execute_interval(
            order_id,
            params.interval_number,
            params.amount,
            params.max_slippage_bps,
            params.price_hint,
        );

        // Simulate first so the fill amounts come back typed, then submit.
        let (executed_amount, execution_price) = call
            .call()
            .await
            .map_err(|e| self.chain_error(format!("executeInterval simulation failed: {}", e)))?;

        let pending = call
            .send()
            .await
            .map_err(|e| self.chain_error(format!("executeInterval reverted: {}", e)))?;
        let receipt = pending
            .await
            .map_err(|e| self.chain_error(format!("executeInterval not mined: {}", e)))?
            .ok_or_else(|| self.chain_error("executeInterval receipt dropped"))?;

        Ok(ExecutionOutcome {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            executed_amount,
            execution_price,
            gas_used: receipt.gas_used.unwrap_or_default().as_u64(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let client = self.client().await?;
        let id = order_id_bytes(order_id)?;
        self.bridge(client)
            .cancel_order(id)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("cancelOrder reverted: {}", e)))?
            .await
            .map_err(|e| self.chain_error(format!("cancelOrder not mined: {}", e)))?;
        Ok(())
    }

    async fn create_htlc(&self, params: &CreateHtlcParams) -> Result<String> {
        let client = self.client().await?;
        let hashed_secret = bytes32(&params.hashed_secret)?;
        let token = if params.token.is_empty() || params.token == "native" {
            Address::zero()
        } else {
            parse_address(&params.token, &self.chain_id, "token")?
        };
        let recipient = parse_address(&params.recipient, &self.chain_id, "recipient")?;

        let call = self.vault(client).new_lock(
            hashed_secret,
            token,
            params.amount,
            recipient,
            params.timeout_height,
            params.timeout_timestamp as u64,
        );
        let lock: Address = call
            .call()
            .await
            .map_err(|e| self.chain_error(format!("newLock simulation failed: {}", e)))?;
        call.send()
            .await
            .map_err(|e| self.chain_error(format!("newLock reverted: {}", e)))?
            .await
            .map_err(|e| self.chain_error(format!("newLock not mined: {}", e)))?;

        Ok(format!("{:?}", lock))
    }

    async fn claim_htlc(&self, htlc_address: &str, secret: &str) -> Result<String> {
        let client = self.client().await?;
        let lock = parse_address(htlc_address, &self.chain_id, "htlc_address")?;
        let secret = bytes32(secret)?;
        let receipt = self
            .vault(client)
            .claim(lock, secret)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("claim reverted: {}", e)))?
            .await
            .map_err(|e| self.chain_error(format!("claim not mined: {}", e)))?
            .ok_or_else(|| self.chain_error("claim receipt dropped"))?;
        Ok(format!("{:?}", receipt.transaction_hash))
    }

    async fn refund_htlc(&self, htlc_address: &str) -> Result<String> {
        let client = self.client().await?;
        let lock = parse_address(htlc_address, &self.chain_id, "htlc_address")?;
        let receipt = self
            .vault(client)
            .refund(lock)
            .send()
            .await
            .map_err(|e| self.chain_error(format!("refund reverted: {}", e)))?
            .await
            .map_err(|e| self.chain_error(format!("refund not mined: {}", e)))?
            .ok_or_else(|| self.chain_error("refund receipt dropped"))?;
        Ok(format!("{:?}", receipt.transaction_hash))
    }

    async fn htlc_status(&self, htlc_address: &str) -> Result<HtlcState> {
        let client = self.client().await?;
        let lock = parse_address(htlc_address, &self.chain_id, "htlc_address")?;
        let (
            hashed_secret,
            amount,
            token,
            sender,
            recipient,
            timeout_height,
            timeout_timestamp,
            status,
            created_at,
            secret,
        ) = self
            .vault(client)
            .lock_state(lock)
            .call()
            .await
            .map_err(|e| self.chain_error(format!("lockState failed: {}", e)))?;

        let status = match status {
            0 => HtlcStatus::Active,
            1 => HtlcStatus::Claimed,
            2 => HtlcStatus::Refunded,
            _ => HtlcStatus::Expired,
        };
        let secret = if secret == [0u8; 32] {
            None
        } else {
            Some(hex::encode(secret))
        };

        Ok(HtlcState {
            address: htlc_address.to_string(),
            hashed_secret: format!("0x{}", hex::encode(hashed_secret)),
            amount,
            token: format!("{:?}", token),
            sender: format!("{:?}", sender),
            recipient: format!("{:?}", recipient),
            timeout_height,
            timeout_timestamp: timeout_timestamp as i64,
            status,
            created_at: Utc
                .timestamp_opt(created_at.as_u64() as i64, 0)
                .single()
                .unwrap_or_else(Utc::now),
            claimed_at: None,
            secret,
        })
    }

    async fn current_price(&self, token_pair: &str) -> Result<Option<U256>> {
        let Some(feed) = self.config.price_feeds.get(token_pair) else {
            return Ok(None);
        };
        let feed = parse_address(feed, &self.chain_id, "price_feed")?;
        let aggregator = AggregatorV3::new(feed, self.provider.clone());

        let decimals = aggregator
            .decimals()
            .call()
            .await
            .map_err(|e| self.chain_error(format!("feed decimals failed: {}", e)))?;
        let (_, answer, _, _, _) = aggregator
            .latest_round_data()
            .call()
            .await
            .map_err(|e| self.chain_error(format!("latestRoundData failed: {}", e)))?;

        if answer.is_negative() || answer.is_zero() {
            return Err(self.chain_error(format!("feed returned non-positive answer {}", answer)));
        }
        let raw = answer.into_raw();
        let price = if (decimals as u32) <= PRICE_DECIMALS {
            raw * U256::exp10((PRICE_DECIMALS - decimals as u32) as usize)
        } else {
            raw / U256::exp10((decimals as u32 - PRICE_DECIMALS) as usize)
        };
        Ok(Some(price))
    }

    async fn twap_price(&self, _token_pair: &str, _window_minutes: u32) -> Result<Option<U256>> {
        // No native TWAP oracle; the aggregator owns windowed pricing.
        Ok(None)
    }

    async fn subscribe(&self, sink: broadcast::Sender<ChainEvent>) -> Result<()> {
        let mut pump = self.pump.write().await;
        if pump.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = EventPump {
            chain_id: self.chain_id.clone(),
            provider: self.provider.clone(),
            addresses: vec![self.bridge_address, self.htlc_address],
            poll_interval: std::time::Duration::from_secs(self.config.event_poll_secs),
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
        let height = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.chain_error(format!("block number query failed: {}", e)))?;
        let block = self
            .provider
            .get_block(height)
            .await
            .map_err(|e| self.chain_error(format!("block query failed: {}", e)))?;
        let gas_price = self.provider.get_gas_price().await.ok();

        Ok(ChainStatusInfo {
            chain_id: self.chain_id.clone(),
            name: self.name.clone(),
            healthy: true,
            last_block_height: height.as_u64(),
            last_block_time: block.and_then(|b| {
                Utc.timestamp_opt(b.timestamp.as_u64() as i64, 0).single()
            }),
            avg_block_time: Some("12s".to_string()),
            gas_price,
            checked_at: Utc::now(),
        })
    }
}

/// Polls contract logs and republishes them as chain events
struct EventPump {
    chain_id: String,
    provider: Arc<Provider<Http>>,
    addresses: Vec<Address>,
    poll_interval: std::time::Duration,
    sink: broadcast::Sender<ChainEvent>,
    stop: watch::Receiver<bool>,
}

impl EventPump {
    async fn run(mut self) {
        let mut last_block = match self.provider.get_block_number().await {
            Ok(b) => b.as_u64(),
            Err(e) => {
                warn!(chain_id = %self.chain_id, error = %e, "event pump start deferred");
                0
            }
        };

        loop {
            if *self.stop.borrow() {
                break;
            }

            tokio::select! {
                _ = self.stop.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let current = match self.provider.get_block_number().await {
                Ok(b) => b.as_u64(),
                Err(e) => {
                    warn!(chain_id = %self.chain_id, error = %e, "failed to poll block number");
                    continue;
                }
            };
            if current <= last_block {
                continue;
            }

            let from = last_block + 1;
            let to = current.min(from + 1000);
            let filter = Filter::new()
                .address(self.addresses.clone())
                .from_block(from)
                .to_block(to);

            match self.provider.get_logs(&filter).await {
                Ok(logs) => {
                    for log in logs {
                        if let Some(event) = parse_log(&self.chain_id, &log) {
                            let _ = self.sink.send(event);
                        }
                    }
                    last_block = to;

                    let mut data = Map::new();
                    data.insert("height".into(), Value::from(to));
                    let _ = self.sink.send(ChainEvent {
                        chain_id: self.chain_id.clone(),
                        event_type: EventType::BlockCreated,
                        block_number: to,
                        tx_hash: String::new(),
                        timestamp: Utc::now(),
                        data,
                        log_index: None,
                    });
                }
                Err(e) => {
                    error!(chain_id = %self.chain_id, error = %e, "failed to fetch logs");
                }
            }
        }
        debug!(chain_id = %self.chain_id, "event pump stopped");
    }
}

fn parse_log(chain_id: &str, log: &Log) -> Option<ChainEvent> {
    let topic = log.topics.first().copied()?;
    let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
    let tx_hash = log
        .transaction_hash
        .map(|h| format!("{:?}", h))
        .unwrap_or_default();
    let log_index = log.log_index.map(|i| i.as_u32());
    let mut data = Map::new();

    let event_type = if topic == *TOPIC_ORDER_CREATED {
        data.insert("order_id".into(), topic_hex(log, 1)?.into());
        EventType::OrderCreated
    } else if topic == *TOPIC_INTERVAL_EXECUTED {
        data.insert("order_id".into(), topic_hex(log, 1)?.into());
        EventType::OrderExecuted
    } else if topic == *TOPIC_ORDER_COMPLETED {
        data.insert("order_id".into(), topic_hex(log, 1)?.into());
        EventType::OrderCompleted
    } else if topic == *TOPIC_ORDER_CANCELLED {
        data.insert("order_id".into(), topic_hex(log, 1)?.into());
        EventType::OrderCancelled
    } else if topic == *TOPIC_LOCK_CREATED {
        data.insert("htlc_address".into(), topic_address(log, 1)?.into());
        data.insert("hashed_secret".into(), topic_hex(log, 2)?.into());
        EventType::HtlcCreated
    } else if topic == *TOPIC_LOCK_CLAIMED {
        data.insert("htlc_address".into(), topic_address(log, 1)?.into());
        if log.data.len() >= 32 {
            data.insert("secret".into(), hex::encode(&log.data[0..32]).into());
        }
        EventType::HtlcClaimed
    } else if topic == *TOPIC_LOCK_REFUNDED {
        data.insert("htlc_address".into(), topic_address(log, 1)?.into());
        EventType::HtlcRefunded
    } else {
        debug!(chain_id = %chain_id, topic = ?topic, "ignoring unrecognised log topic");
        return None;
    };

    Some(ChainEvent {
        chain_id: chain_id.to_string(),
        event_type,
        block_number,
        tx_hash,
        timestamp: Utc::now(),
        data,
        log_index,
    })
}

fn topic_hex(log: &Log, index: usize) -> Option<String> {
    log.topics
        .get(index)
        .map(|t| format!("0x{}", hex::encode(t.as_bytes())))
}

fn topic_address(log: &Log, index: usize) -> Option<String> {
    log.topics
        .get(index)
        .map(|t| format!("{:?}", Address::from_slice(&t.as_bytes()[12..])))
}

fn parse_address(value: &str, chain_id: &str, field: &str) -> Result<Address> {
    Address::from_str(value).map_err(|e| {
        OrchestratorError::Config(format!("invalid {} for {}: {}", field, chain_id, e))
    })
}

/// Order ids on EVM chains are the 0x-prefixed 32-byte hex id itself
fn order_id_bytes(order_id: &str) -> Result<[u8; 32]> {
    bytes32(order_id)
}

fn bytes32(value: &str) -> Result<[u8; 32]> {
    let trimmed = value.trim_start_matches("0x");
    let bytes = hex::decode(trimmed)
        .map_err(|e| OrchestratorError::Validation(format!("invalid hex {:?}: {}", value, e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| OrchestratorError::Validation(format!("{:?} is not 32 bytes", value)))
}

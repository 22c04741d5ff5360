//! Adapter-facing parameter, result, and event types

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::HtlcStatus;

/// Parameters for registering a TWAP order on a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTwapOrderParams {
    pub order_id: String,
    pub user_address: String,
    pub source_token: String,
    pub target_token: String,
    pub amount: U256,
    pub min_received: U256,
    pub window_minutes: u32,
    pub intervals: u32,
    pub max_slippage_bps: u32,
    pub hashed_secret: String,
    pub timeout_height: u64,
    pub timeout_timestamp: i64,
}

/// Parameters for executing one TWAP interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteIntervalParams {
    pub order_id: String,
    pub interval_number: u32,
    pub amount: U256,
    pub max_slippage_bps: u32,
    /// Expected price used on-chain for slippage bounding; zero when the
    /// cache had no data
    pub price_hint: U256,
}

/// Outcome of a successfully submitted interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub tx_hash: String,
    pub executed_amount: U256,
    pub execution_price: U256,
    pub gas_used: u64,
}

/// Parameters for creating an HTLC lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHtlcParams {
    pub order_id: String,
    pub hashed_secret: String,
    pub amount: U256,
    pub token: String,
    pub recipient: String,
    pub timeout_height: u64,
    pub timeout_timestamp: i64,
}

/// On-chain view of an HTLC lock as reported by an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtlcState {
    pub address: String,
    pub hashed_secret: String,
    pub amount: U256,
    pub token: String,
    pub sender: String,
    pub recipient: String,
    pub timeout_height: u64,
    pub timeout_timestamp: i64,
    pub status: HtlcStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub secret: Option<String>,
}

/// Live chain condition as reported by an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStatusInfo {
    pub chain_id: String,
    pub name: String,
    pub healthy: bool,
    pub last_block_height: u64,
    pub last_block_time: Option<DateTime<Utc>>,
    pub avg_block_time: Option<String>,
    pub gas_price: Option<U256>,
    pub checked_at: DateTime<Utc>,
}

/// Parameters for a paired cross-chain HTLC swap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossChainSwapParams {
    pub source_chain: String,
    pub target_chain: String,
    pub source_user: String,
    pub target_recipient: String,
    pub source_token: String,
    pub target_token: String,
    pub amount: U256,
    pub target_amount: U256,
    pub order_id: String,
    pub hashed_secret: String,
    pub timeout_height: u64,
    pub timeout_timestamp: i64,
}

/// Result of a paired HTLC creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossChainSwapResult {
    pub source_htlc: String,
    pub target_htlc: String,
    pub source_chain: String,
    pub target_chain: String,
    pub created_at: DateTime<Utc>,
}

/// Event types the core recognises; everything else parses as `Other`
/// and is ignored after logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    OrderCreated,
    OrderExecuted,
    OrderCompleted,
    OrderCancelled,
    HtlcCreated,
    HtlcClaimed,
    HtlcRefunded,
    PriceUpdate,
    BlockCreated,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::OrderCreated => "order_created",
            EventType::OrderExecuted => "order_executed",
            EventType::OrderCompleted => "order_completed",
            EventType::OrderCancelled => "order_cancelled",
            EventType::HtlcCreated => "htlc_created",
            EventType::HtlcClaimed => "htlc_claimed",
            EventType::HtlcRefunded => "htlc_refunded",
            EventType::PriceUpdate => "price_update",
            EventType::BlockCreated => "block_created",
            EventType::Other(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "order_created" => EventType::OrderCreated,
            "order_executed" => EventType::OrderExecuted,
            "order_completed" => EventType::OrderCompleted,
            "order_cancelled" => EventType::OrderCancelled,
            "htlc_created" => EventType::HtlcCreated,
            "htlc_claimed" => EventType::HtlcClaimed,
            "htlc_refunded" => EventType::HtlcRefunded,
            "price_update" => EventType::PriceUpdate,
            "block_created" => EventType::BlockCreated,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::parse(&s))
    }
}

/// An event observed on a chain. `data` is an open key/value bag; handlers
/// read the keys they know and ignore the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain_id: String,
    pub event_type: EventType,
    pub block_number: u64,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub log_index: Option<u32>,
}

impl ChainEvent {
    /// Fetch a string field from the event data bag
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_parse_round_trips() {
        for name in [
            "order_created",
            "order_executed",
            "order_completed",
            "order_cancelled",
            "htlc_created",
            "htlc_claimed",
            "htlc_refunded",
            "price_update",
            "block_created",
        ] {
            assert_eq!(EventType::parse(name).as_str(), name);
        }
        assert_eq!(
            EventType::parse("governance_vote"),
            EventType::Other("governance_vote".to_string())
        );
    }

    #[test]
    fn chain_event_ignores_unknown_data_keys() {
        let json = serde_json::json!({
            "chain_id": "ethereum",
            "event_type": "htlc_claimed",
            "block_number": 123,
            "tx_hash": "0xabc",
            "timestamp": "2024-05-01T00:00:00Z",
            "data": {
                "htlc_address": "lock-1",
                "secret": "deadbeef",
                "some_future_field": {"nested": true}
            }
        });
        let event: ChainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.event_type, EventType::HtlcClaimed);
        assert_eq!(event.data_str("htlc_address"), Some("lock-1"));
        assert_eq!(event.data_str("missing"), None);
    }
}

//! TWAP order entity and state-machine helpers

use chrono::{DateTime, Duration, Utc};
use ethers::types::{U256, U512};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key set while an order awaits operator review after a
/// post-trade slippage breach. Orders carrying it are never scheduled.
pub const META_SLIPPAGE_REVIEW: &str = "slippage_review";

/// Order lifecycle states. `PartiallyFilled` is a display projection only
/// and is never persisted; the store writes `Executing` during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Executing,
    PartiallyFilled,
    Completed,
    Cancelled,
    Expired,
    Refunded,
    Claimed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Executing => "executing",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Claimed => "claimed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "executing" => Some(OrderStatus::Executing),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "expired" => Some(OrderStatus::Expired),
            "refunded" => Some(OrderStatus::Refunded),
            "claimed" => Some(OrderStatus::Claimed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions, with the single
    /// exception of `Completed -> Claimed` on a valid HTLC claim.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Refunded
                | OrderStatus::Claimed
        )
    }

    /// Whether a transition to `next` is legal
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (*self, next) {
            (Pending, Executing) => true,
            (Executing, Executing) => true,
            (Pending | Executing, Completed) => true,
            (Pending | Executing, Cancelled) => true,
            (Pending | Executing, Expired) => true,
            (Pending | Executing, Refunded) => true,
            (Completed, Claimed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A TWAP order. Immutable after creation except for the mutable tail
/// (`executed_amount`, `last_execution`, `average_price`, `status`,
/// `updated_at`, `metadata`), which only the store's versioned update
/// paths may touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub user_address: String,
    pub source_chain: String,
    pub target_chain: String,
    pub source_token: String,
    pub source_amount: U256,
    pub target_token: String,
    pub target_recipient: String,
    pub min_received: U256,
    /// TWAP window length in minutes (W)
    pub window_minutes: u32,
    /// Number of execution intervals (K)
    pub execution_intervals: u32,
    /// Maximum tolerated slippage in basis points (S)
    pub max_slippage_bps: u32,
    /// Minimum fill size (M); the closing interval may go below it
    pub min_fill_size: U256,
    pub mev_protection: bool,
    /// Hex-encoded 32-byte hash commitment over the swap secret
    pub hashed_secret: String,
    pub timeout_height: u64,
    pub timeout_timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_amount: U256,
    pub last_execution: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    /// Amount-weighted mean of all recorded execution prices
    pub average_price: U256,
    pub metadata: Map<String, Value>,
}

impl Order {
    /// Notional still to be executed
    pub fn remaining_amount(&self) -> U256 {
        self.source_amount.saturating_sub(self.executed_amount)
    }

    /// Spacing between intervals: (W * 60) / K seconds
    pub fn interval_duration(&self) -> Duration {
        let secs = (self.window_minutes as i64 * 60) / self.execution_intervals as i64;
        Duration::seconds(secs)
    }

    /// Whether the next interval is due at `now`
    pub fn interval_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_execution {
            None => true,
            Some(last) => now >= last + self.interval_duration(),
        }
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.timeout_timestamp
    }

    pub fn is_height_expired(&self, current_height: u64) -> bool {
        current_height >= self.timeout_height
    }

    /// Token pair label used for price lookups, e.g. "ETH_USDC"
    pub fn token_pair(&self) -> String {
        format!("{}_{}", self.source_token, self.target_token)
    }

    /// Completion percentage for display only; never used in order math
    pub fn completion_rate(&self) -> f64 {
        if self.source_amount.is_zero() {
            return 0.0;
        }
        let done = self.executed_amount.full_mul(U256::from(10_000u64))
            / U512::from(self.source_amount);
        done.as_u64() as f64 / 100.0
    }

    /// Display status: surfaces `partially_filled` while mid-execution
    pub fn display_status(&self) -> OrderStatus {
        if self.status == OrderStatus::Executing
            && !self.executed_amount.is_zero()
            && self.executed_amount < self.source_amount
        {
            OrderStatus::PartiallyFilled
        } else {
            self.status
        }
    }

    /// Fold a fill into the mutable tail: extends `executed_amount`,
    /// refreshes the running weighted average against the *previous*
    /// executed amount, stamps `last_execution`, and moves the status to
    /// `Executing` or `Completed`.
    pub fn apply_fill(&mut self, amount: U256, price: U256, at: DateTime<Utc>) {
        self.average_price = if self.executed_amount.is_zero() {
            price
        } else {
            super::money::weighted_price(self.average_price, self.executed_amount, price, amount)
        };
        self.executed_amount += amount;
        self.last_execution = Some(at);
        self.status = if self.executed_amount >= self.source_amount {
            OrderStatus::Completed
        } else {
            OrderStatus::Executing
        };
        self.updated_at = at;
    }

    /// Whether the order is parked pending operator review
    pub fn requires_review(&self) -> bool {
        self.metadata
            .get(META_SLIPPAGE_REVIEW)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Park the order after a post-trade slippage breach
    pub fn flag_for_review(&mut self, observed_bps: u32) {
        self.metadata
            .insert(META_SLIPPAGE_REVIEW.to_string(), Value::Bool(true));
        self.metadata.insert(
            "slippage_review_bps".to_string(),
            Value::from(observed_bps),
        );
    }
}

/// One executed TWAP interval; appended once, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub order_id: String,
    pub interval_number: u32,
    pub timestamp: DateTime<Utc>,
    pub amount: U256,
    pub price: U256,
    pub gas_used: Option<u64>,
    pub slippage_bps: Option<u32>,
    pub tx_hash: Option<String>,
    pub chain_id: String,
}

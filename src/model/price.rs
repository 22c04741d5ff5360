//! Price observation entity

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// One (timestamp, price) observation from one source for one pair.
/// Append-only; old points are pruned after the retention horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub token_pair: String,
    pub source: String,
    /// Fixed-point, 18 fractional digits
    pub price: U256,
    pub volume: Option<U256>,
    pub timestamp: DateTime<Utc>,
    pub chain_id: Option<String>,
}

impl PricePoint {
    pub fn new(token_pair: &str, source: &str, price: U256, timestamp: DateTime<Utc>) -> Self {
        Self {
            token_pair: token_pair.to_string(),
            source: source.to_string(),
            price,
            volume: None,
            timestamp,
            chain_id: None,
        }
    }
}

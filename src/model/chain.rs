//! Chain status entity

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ChainHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainHealth::Healthy => "healthy",
            ChainHealth::Degraded => "degraded",
            ChainHealth::Unhealthy => "unhealthy",
            ChainHealth::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => ChainHealth::Healthy,
            "degraded" => ChainHealth::Degraded,
            "unhealthy" => ChainHealth::Unhealthy,
            _ => ChainHealth::Unknown,
        }
    }
}

/// Persisted view of a chain's condition, refreshed from block events and
/// health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStatusRecord {
    pub chain_id: String,
    pub name: String,
    pub enabled: bool,
    pub last_block_height: Option<u64>,
    pub last_block_time: Option<DateTime<Utc>>,
    pub avg_block_time: Option<String>,
    pub gas_price: Option<U256>,
    pub health: ChainHealth,
    pub last_health_check: DateTime<Utc>,
}

//! Chain adapter surface
//!
//! Every supported ledger sits behind the same [`ChainAdapter`] capability
//! set; the core reads only chain id strings and never learns which family
//! a chain belongs to. Construction in the registry is the one place where
//! variants are resolved.

pub mod bitcoin;
pub mod cosmos;
pub mod evm;
mod gateway;
pub mod registry;
pub mod stellar;
pub mod types;

pub use registry::{AdapterRegistry, HtlcPairError};
pub use types::{
    ChainEvent, ChainStatusInfo, CreateHtlcParams, CreateTwapOrderParams, CrossChainSwapParams,
    CrossChainSwapResult, EventType, ExecuteIntervalParams, ExecutionOutcome, HtlcState,
};

use async_trait::async_trait;
use ethers::types::U256;
use tokio::sync::broadcast;

use crate::error::Result;

/// Uniform per-chain capability set.
///
/// Adapters own their network retries; the core never retries an adapter
/// call — a failed interval is simply picked up again on the next
/// scheduler tick. All methods must tolerate concurrent invocation.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> &str;
    fn name(&self) -> &str;

    // Lifecycle
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn is_connected(&self) -> bool;

    // Identity
    async fn address(&self) -> Result<String>;
    async fn balance(&self, token: &str) -> Result<U256>;

    // TWAP plane
    async fn create_twap_order(&self, params: &CreateTwapOrderParams) -> Result<String>;
    async fn execute_twap_interval(
        &self,
        params: &ExecuteIntervalParams,
    ) -> Result<ExecutionOutcome>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    // HTLC plane
    async fn create_htlc(&self, params: &CreateHtlcParams) -> Result<String>;
    async fn claim_htlc(&self, htlc_address: &str, secret: &str) -> Result<String>;
    async fn refund_htlc(&self, htlc_address: &str) -> Result<String>;
    async fn htlc_status(&self, htlc_address: &str) -> Result<HtlcState>;

    // Price plane; `None` where the chain exposes no native oracle and the
    // aggregator is authoritative
    async fn current_price(&self, token_pair: &str) -> Result<Option<U256>>;
    async fn twap_price(&self, token_pair: &str, window_minutes: u32) -> Result<Option<U256>>;

    // Event plane
    async fn subscribe(&self, sink: broadcast::Sender<ChainEvent>) -> Result<()>;
    async fn unsubscribe(&self) -> Result<()>;

    // Health
    async fn chain_status(&self) -> Result<ChainStatusInfo>;
}

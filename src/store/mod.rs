//! Persistence boundary
//!
//! The core only ever talks to the [`Store`] trait; backends own their
//! connection handling and transactional semantics. Two backends ship:
//! [`MemoryStore`] for tests and development, [`PostgresStore`] for
//! production.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    ChainStatusRecord, ExecutionRecord, Htlc, HtlcStatus, Order, PricePoint,
};

/// Errors surfaced by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("version conflict on {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store closed")]
    Closed,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable state owned by the orchestrator.
///
/// Mutations of an order's tail go through `update_order` /
/// `record_execution`, both of which take the caller's last-seen
/// `updated_at` and fail with [`StoreError::Conflict`] when another writer
/// got there first. `record_execution` is the single-transaction fill
/// commit: the execution record append and the order tail update land
/// together or not at all, and the record's `interval_number` must equal
/// the current record count.
#[async_trait]
pub trait Store: Send + Sync {
    // Orders
    async fn create_order(&self, order: &Order) -> StoreResult<()>;
    async fn order(&self, order_id: &str) -> StoreResult<Order>;
    async fn orders_by_user(
        &self,
        user_address: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Order>>;
    async fn update_order(
        &self,
        order: &Order,
        expected_version: DateTime<Utc>,
    ) -> StoreResult<Order>;
    /// Orders with status pending/executing whose next interval is due at
    /// `now`. Height gating and review flags are the engine's concern.
    async fn executable_orders(&self, now: DateTime<Utc>) -> StoreResult<Vec<Order>>;

    // Execution history
    async fn record_execution(
        &self,
        order: &Order,
        record: &ExecutionRecord,
        expected_version: DateTime<Utc>,
    ) -> StoreResult<Order>;
    async fn execution_history(&self, order_id: &str) -> StoreResult<Vec<ExecutionRecord>>;

    // Price points
    async fn store_price_point(&self, point: &PricePoint) -> StoreResult<()>;
    async fn price_points_since(
        &self,
        token_pair: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<PricePoint>>;
    async fn latest_price(&self, token_pair: &str, source: &str)
        -> StoreResult<Option<PricePoint>>;
    async fn prune_price_points(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    // HTLCs
    /// Returns false when a lock with this address already exists
    /// (idempotent replay of `htlc_created`).
    async fn create_htlc(&self, htlc: &Htlc) -> StoreResult<bool>;
    async fn htlc(&self, address: &str) -> StoreResult<Htlc>;
    async fn update_htlc(&self, htlc: &Htlc) -> StoreResult<()>;
    async fn htlcs_by_status(&self, status: HtlcStatus) -> StoreResult<Vec<Htlc>>;

    // Chain status
    async fn upsert_chain_status(&self, status: &ChainStatusRecord) -> StoreResult<()>;
    async fn chain_status(&self, chain_id: &str) -> StoreResult<ChainStatusRecord>;

    async fn health(&self) -> StoreResult<()>;
    async fn close(&self);
}

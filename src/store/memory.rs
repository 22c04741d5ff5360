//! In-memory store backend
//!
//! A single writer lock over the whole state keeps multi-entity updates
//! serialisable, which is exactly what the fill commit needs. Good enough
//! for tests and single-node development; production uses Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Store, StoreError, StoreResult};
use crate::model::{
    ChainStatusRecord, ExecutionRecord, Htlc, HtlcStatus, Order, OrderStatus, PricePoint,
};

#[derive(Default)]
struct Inner {
    orders: HashMap<String, Order>,
    executions: HashMap<String, Vec<ExecutionRecord>>,
    htlcs: HashMap<String, Htlc>,
    price_points: Vec<PricePoint>,
    chain_status: HashMap<String, ChainStatusRecord>,
    closed: bool,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_order(&self, order: &Order) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate(order.id.clone()));
        }
        inner.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn order(&self, order_id: &str) -> StoreResult<Order> {
        self.inner
            .read()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn orders_by_user(
        &self,
        user_address: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Order>> {
        let inner = self.inner.read().await;
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.user_address == user_address)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_order(
        &self,
        order: &Order,
        expected_version: DateTime<Utc>,
    ) -> StoreResult<Order> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .orders
            .get_mut(&order.id)
            .ok_or(StoreError::NotFound)?;
        if stored.updated_at != expected_version {
            return Err(StoreError::Conflict(order.id.clone()));
        }
        let mut updated = order.clone();
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn executable_orders(&self, now: DateTime<Utc>) -> StoreResult<Vec<Order>> {
        let inner = self.inner.read().await;
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| {
                matches!(o.status, OrderStatus::Pending | OrderStatus::Executing)
                    && o.interval_due(now)
            })
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn record_execution(
        &self,
        order: &Order,
        record: &ExecutionRecord,
        expected_version: DateTime<Utc>,
    ) -> StoreResult<Order> {
        let mut inner = self.inner.write().await;

        let existing = inner
            .executions
            .get(&order.id)
            .map(|v| v.len() as u32)
            .unwrap_or(0);
        if record.interval_number != existing {
            return Err(StoreError::Conflict(format!(
                "{}: interval {} != next {}",
                order.id, record.interval_number, existing
            )));
        }

        let stored = inner
            .orders
            .get(&order.id)
            .ok_or(StoreError::NotFound)?;
        if stored.updated_at != expected_version {
            return Err(StoreError::Conflict(order.id.clone()));
        }

        let mut updated = order.clone();
        updated.updated_at = Utc::now();
        inner.orders.insert(order.id.clone(), updated.clone());
        inner
            .executions
            .entry(order.id.clone())
            .or_default()
            .push(record.clone());
        Ok(updated)
    }

    async fn execution_history(&self, order_id: &str) -> StoreResult<Vec<ExecutionRecord>> {
        let inner = self.inner.read().await;
        let mut records = inner.executions.get(order_id).cloned().unwrap_or_default();
        records.sort_by_key(|r| r.interval_number);
        Ok(records)
    }

    async fn store_price_point(&self, point: &PricePoint) -> StoreResult<()> {
        self.inner.write().await.price_points.push(point.clone());
        Ok(())
    }

    async fn price_points_since(
        &self,
        token_pair: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<PricePoint>> {
        let inner = self.inner.read().await;
        let mut points: Vec<PricePoint> = inner
            .price_points
            .iter()
            .filter(|p| p.token_pair == token_pair && p.timestamp >= since)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    async fn latest_price(
        &self,
        token_pair: &str,
        source: &str,
    ) -> StoreResult<Option<PricePoint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .price_points
            .iter()
            .filter(|p| p.token_pair == token_pair && p.source == source)
            .max_by_key(|p| p.timestamp)
            .cloned())
    }

    async fn prune_price_points(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.price_points.len();
        inner.price_points.retain(|p| p.timestamp >= older_than);
        Ok((before - inner.price_points.len()) as u64)
    }

    async fn create_htlc(&self, htlc: &Htlc) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.htlcs.contains_key(&htlc.address) {
            return Ok(false);
        }
        inner.htlcs.insert(htlc.address.clone(), htlc.clone());
        Ok(true)
    }

    async fn htlc(&self, address: &str) -> StoreResult<Htlc> {
        self.inner
            .read()
            .await
            .htlcs
            .get(address)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_htlc(&self, htlc: &Htlc) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.htlcs.contains_key(&htlc.address) {
            return Err(StoreError::NotFound);
        }
        inner.htlcs.insert(htlc.address.clone(), htlc.clone());
        Ok(())
    }

    async fn htlcs_by_status(&self, status: HtlcStatus) -> StoreResult<Vec<Htlc>> {
        let inner = self.inner.read().await;
        Ok(inner
            .htlcs
            .values()
            .filter(|h| h.status == status)
            .cloned()
            .collect())
    }

    async fn upsert_chain_status(&self, status: &ChainStatusRecord) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .chain_status
            .insert(status.chain_id.clone(), status.clone());
        Ok(())
    }

    async fn chain_status(&self, chain_id: &str) -> StoreResult<ChainStatusRecord> {
        self.inner
            .read()
            .await
            .chain_status
            .get(chain_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn health(&self) -> StoreResult<()> {
        if self.inner.read().await.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.inner.write().await.closed = true;
    }
}

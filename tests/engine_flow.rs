//! End-to-end TWAP execution scenarios over the in-memory store
//!
//! Ticks are driven directly (`process_executable_orders` + `drain_queued`)
//! instead of waiting on wall-clock timers, so every scenario is
//! deterministic.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ethers::types::U256;
use serde_json::Map;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aqueduct::adapters::{
    AdapterRegistry, ChainAdapter, ChainEvent, ChainStatusInfo, CreateHtlcParams,
    CreateTwapOrderParams, ExecuteIntervalParams, ExecutionOutcome, HtlcState,
};
use aqueduct::config::TwapConfig;
use aqueduct::error::{OrchestratorError, Result};
use aqueduct::model::{money::PRICE_SCALE, Order, OrderStatus, PricePoint};
use aqueduct::store::{MemoryStore, Store};
use aqueduct::twap::{Engine, ExecutionRequest, PriceCache, PriceFeedAggregator};

fn px(n: u64) -> U256 {
    U256::from(n) * PRICE_SCALE
}

/// Adapter that fills exactly what it is asked at a programmable price
struct ScriptedAdapter {
    chain_id: String,
    execution_price: Mutex<U256>,
    fail_execution: AtomicBool,
    height: AtomicU64,
    executions: Mutex<Vec<ExecuteIntervalParams>>,
}

impl ScriptedAdapter {
    fn new(chain_id: &str, execution_price: U256) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            execution_price: Mutex::new(execution_price),
            fail_execution: AtomicBool::new(false),
            height: AtomicU64::new(1_000),
            executions: Mutex::new(Vec::new()),
        }
    }

    fn set_price(&self, price: U256) {
        *self.execution_price.lock().unwrap() = price;
    }

    fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainAdapter for ScriptedAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }
    fn name(&self) -> &str {
        "Scripted"
    }
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
    async fn is_connected(&self) -> bool {
        true
    }
    async fn address(&self) -> Result<String> {
        Ok("0xoperator".into())
    }
    async fn balance(&self, _token: &str) -> Result<U256> {
        Ok(U256::zero())
    }
    async fn create_twap_order(&self, params: &CreateTwapOrderParams) -> Result<String> {
        Ok(params.order_id.clone())
    }
    async fn execute_twap_interval(
        &self,
        params: &ExecuteIntervalParams,
    ) -> Result<ExecutionOutcome> {
        if self.fail_execution.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Chain {
                chain_id: self.chain_id.clone(),
                message: "rpc unavailable".into(),
            });
        }
        self.executions.lock().unwrap().push(params.clone());
        Ok(ExecutionOutcome {
            tx_hash: format!("0xtx{}", params.interval_number),
            executed_amount: params.amount,
            execution_price: *self.execution_price.lock().unwrap(),
            gas_used: 150_000,
        })
    }
    async fn cancel_order(&self, _order_id: &str) -> Result<()> {
        Ok(())
    }
    async fn create_htlc(&self, _params: &CreateHtlcParams) -> Result<String> {
        Ok("lock".into())
    }
    async fn claim_htlc(&self, _address: &str, _secret: &str) -> Result<String> {
        Ok("0x".into())
    }
    async fn refund_htlc(&self, _address: &str) -> Result<String> {
        Ok("0x".into())
    }
    async fn htlc_status(&self, address: &str) -> Result<HtlcState> {
        Err(OrchestratorError::NotFound(format!("htlc {}", address)))
    }
    async fn current_price(&self, _pair: &str) -> Result<Option<U256>> {
        Ok(None)
    }
    async fn twap_price(&self, _pair: &str, _w: u32) -> Result<Option<U256>> {
        Ok(None)
    }
    async fn subscribe(&self, _sink: tokio::sync::broadcast::Sender<ChainEvent>) -> Result<()> {
        Ok(())
    }
    async fn unsubscribe(&self) -> Result<()> {
        Ok(())
    }
    async fn chain_status(&self) -> Result<ChainStatusInfo> {
        Ok(ChainStatusInfo {
            chain_id: self.chain_id.clone(),
            name: "Scripted".into(),
            healthy: true,
            last_block_height: self.height.load(Ordering::SeqCst),
            last_block_time: Some(Utc::now()),
            avg_block_time: None,
            gas_price: None,
            checked_at: Utc::now(),
        })
    }
}

fn twap_config() -> TwapConfig {
    TwapConfig {
        update_interval_secs: 30,
        price_update_interval_secs: 10,
        feed_deadline_secs: 60,
        window_min: 5,
        window_max: 1440,
        max_slippage_bps: 500,
        default_slippage_bps: 100,
        min_execution_interval_secs: 60,
        max_execution_interval_secs: 3600,
        min_liquidity: "10000".into(),
        execution_queue_capacity: 100,
        pairs: vec![],
        price_max_age_hours: 24,
        price_retention_hours: 72,
    }
}

struct Harness {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    cache: Arc<PriceCache>,
    adapter: Arc<ScriptedAdapter>,
}

fn harness(execution_price: U256) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let adapter = Arc::new(ScriptedAdapter::new("ethereum", execution_price));
    let registry = Arc::new(AdapterRegistry::with_adapters(vec![
        adapter.clone() as Arc<dyn ChainAdapter>
    ]));
    let cache = Arc::new(PriceCache::new(Duration::from_secs(86_400)));
    let aggregator = Arc::new(PriceFeedAggregator::new(
        vec![],
        vec![],
        cache.clone(),
        store.clone() as Arc<dyn Store>,
        Duration::from_secs(60),
    ));
    let engine = Arc::new(Engine::new(
        twap_config(),
        store.clone() as Arc<dyn Store>,
        registry,
        cache.clone(),
        aggregator,
    ));
    Harness {
        engine,
        store,
        cache,
        adapter,
    }
}

fn order(id: &str, amount: U256, intervals: u32, slippage_bps: u32, min_fill: U256) -> Order {
    let now = Utc::now();
    Order {
        id: id.into(),
        user_address: "0xuser".into(),
        source_chain: "ethereum".into(),
        target_chain: "ethereum".into(),
        source_token: "ETH".into(),
        source_amount: amount,
        target_token: "USDC".into(),
        target_recipient: "0xrecipient".into(),
        min_received: U256::zero(),
        window_minutes: 20,
        execution_intervals: intervals,
        max_slippage_bps: slippage_bps,
        min_fill_size: min_fill,
        mev_protection: true,
        hashed_secret: "00".repeat(32),
        timeout_height: 1_000_000,
        timeout_timestamp: now.timestamp() + 86_400,
        created_at: now,
        updated_at: now,
        executed_amount: U256::zero(),
        last_execution: None,
        status: OrderStatus::Pending,
        average_price: U256::zero(),
        metadata: Map::new(),
    }
}

fn feed_price(cache: &PriceCache, pair: &str, price: U256) {
    cache.record(PricePoint::new(pair, "test", price, Utc::now()));
}

/// Make the next interval due by rewinding last_execution
async fn rewind_interval(store: &MemoryStore, order_id: &str, seconds: i64) {
    let current = store.order(order_id).await.unwrap();
    if current.last_execution.is_none() {
        return;
    }
    let mut rewound = current.clone();
    rewound.last_execution = current
        .last_execution
        .map(|t| t - ChronoDuration::seconds(seconds));
    store
        .update_order(&rewound, current.updated_at)
        .await
        .unwrap();
}

async fn run_tick(h: &Harness) -> usize {
    h.engine.process_executable_orders().await.unwrap();
    h.engine.drain_queued().await
}

#[tokio::test]
async fn clean_full_execution_over_four_intervals() {
    let h = harness(px(2000));
    let o = order("ord-s1", px(1000), 4, 100, px(100));
    h.store.create_order(&o).await.unwrap();

    for tick in 0..4 {
        feed_price(&h.cache, "ETH_USDC", px(2000));
        assert_eq!(run_tick(&h).await, 1, "tick {} should execute", tick);
        rewind_interval(&h.store, "ord-s1", 301).await;
    }

    let stored = h.store.order("ord-s1").await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.executed_amount, px(1000));
    assert_eq!(stored.average_price, px(2000));

    let history = h.store.execution_history("ord-s1").await.unwrap();
    assert_eq!(history.len(), 4);
    let mut sum = U256::zero();
    for (i, record) in history.iter().enumerate() {
        assert_eq!(record.interval_number as usize, i);
        assert_eq!(record.amount, px(250));
        assert_eq!(record.price, px(2000));
        sum += record.amount;
    }
    assert_eq!(sum, stored.executed_amount);
    for pair in history.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // a completed order never executes again
    feed_price(&h.cache, "ETH_USDC", px(2000));
    assert_eq!(run_tick(&h).await, 0);
    assert_eq!(h.adapter.execution_count(), 4);

    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.successful_executions, 4);
    assert_eq!(metrics.total_volume_executed, px(1000));
}

#[tokio::test]
async fn slippage_guard_blocks_the_interval() {
    let h = harness(px(2000));
    let o = order("ord-s2", px(1000), 4, 50, px(100));
    h.store.create_order(&o).await.unwrap();

    // TWAP anchored at 2000 by a long-standing pair of points, then a
    // fresh 2020 print: 100 bps away, above the 50 bps tolerance.
    h.cache.record(PricePoint::new(
        "ETH_USDC",
        "test",
        px(2000),
        Utc::now() - ChronoDuration::seconds(1000),
    ));
    h.cache.record(PricePoint::new(
        "ETH_USDC",
        "test",
        px(2000),
        Utc::now() - ChronoDuration::seconds(2),
    ));
    feed_price(&h.cache, "ETH_USDC", px(2020));

    h.engine.process_executable_orders().await.unwrap();
    assert_eq!(h.engine.drain_queued().await, 1);

    // the interval failed: nothing recorded, nothing executed
    assert_eq!(h.adapter.execution_count(), 0);
    let stored = h.store.order("ord-s2").await.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.executed_amount, U256::zero());
    assert!(h
        .store
        .execution_history("ord-s2")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.engine.metrics().await.failed_executions, 1);

    // price comes back in line; the next tick succeeds
    feed_price(&h.cache, "ETH_USDC", px(2000));
    assert_eq!(run_tick(&h).await, 1);
    assert_eq!(h.adapter.execution_count(), 1);
}

#[tokio::test]
async fn slippage_boundary_is_inclusive() {
    let h = harness(px(2000));
    let o = order("ord-bound", px(1000), 4, 50, px(100));
    h.store.create_order(&o).await.unwrap();

    // exactly 50 bps away from the hint: accepted
    feed_price(&h.cache, "ETH_USDC", px(2010));
    let outcome = h
        .engine
        .execute_interval(ExecutionRequest {
            order_id: "ord-bound".into(),
            interval_number: 0,
            target_amount: px(250),
            max_slippage_bps: 50,
            price_hint: px(2000),
            respond_to: None,
        })
        .await;
    assert!(outcome.is_ok(), "50 bps at the limit must pass: {:?}", outcome.err());

    // 55 bps away: rejected
    feed_price(&h.cache, "ETH_USDC", px(2011));
    let outcome = h
        .engine
        .execute_interval(ExecutionRequest {
            order_id: "ord-bound".into(),
            interval_number: 1,
            target_amount: px(250),
            max_slippage_bps: 50,
            price_hint: px(2000),
            respond_to: None,
        })
        .await;
    assert!(matches!(
        outcome,
        Err(OrchestratorError::SlippageExceeded {
            slippage_bps: 55,
            max_bps: 50
        })
    ));
}

#[tokio::test]
async fn empty_price_window_executes_unchecked() {
    let h = harness(px(2000));
    let o = order("ord-nodata", px(1000), 4, 50, px(100));
    h.store.create_order(&o).await.unwrap();

    // no price data at all: the interval still runs, gated by nothing
    assert_eq!(run_tick(&h).await, 1);
    assert_eq!(h.adapter.execution_count(), 1);
    let history = h.store.execution_history("ord-nodata").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].slippage_bps, Some(0));
}

#[tokio::test]
async fn closing_interval_takes_the_dust() {
    let h = harness(px(2000));
    let o = order("ord-dust", px(305), 3, 100, px(100));
    h.store.create_order(&o).await.unwrap();
    feed_price(&h.cache, "ETH_USDC", px(2000));

    // two regular intervals of remaining/3 then remaining/2; the plan
    // spaces intervals 400s apart (20min / 3)
    assert_eq!(run_tick(&h).await, 1);
    rewind_interval(&h.store, "ord-dust", 401).await;
    assert_eq!(run_tick(&h).await, 1);
    rewind_interval(&h.store, "ord-dust", 401).await;

    let mid = h.store.order("ord-dust").await.unwrap();
    let remaining = mid.source_amount - mid.executed_amount;
    assert!(remaining > U256::zero());

    // final interval executes exactly the remainder
    assert_eq!(run_tick(&h).await, 1);
    let stored = h.store.order("ord-dust").await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.executed_amount, px(305));

    let history = h.store.execution_history("ord-dust").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].amount, remaining);
}

#[tokio::test]
async fn last_interval_fires_below_min_fill() {
    let h = harness(px(2000));
    let mut o = order("ord-small", px(305), 3, 100, px(100));
    // two fills already happened; 55 remains, below the 100 minimum
    o.executed_amount = px(250);
    o.status = OrderStatus::Executing;
    h.store.create_order(&o).await.unwrap();
    let stored = h.store.order("ord-small").await.unwrap();
    let mut with_history = stored.clone();
    with_history.executed_amount = px(125);
    let stored = h
        .store
        .record_execution(
            &with_history,
            &aqueduct::model::ExecutionRecord {
                order_id: "ord-small".into(),
                interval_number: 0,
                timestamp: Utc::now(),
                amount: px(125),
                price: px(2000),
                gas_used: None,
                slippage_bps: None,
                tx_hash: None,
                chain_id: "ethereum".into(),
            },
            stored.updated_at,
        )
        .await
        .unwrap();
    let mut with_history = stored.clone();
    with_history.executed_amount = px(250);
    h.store
        .record_execution(
            &with_history,
            &aqueduct::model::ExecutionRecord {
                order_id: "ord-small".into(),
                interval_number: 1,
                timestamp: Utc::now(),
                amount: px(125),
                price: px(2000),
                gas_used: None,
                slippage_bps: None,
                tx_hash: None,
                chain_id: "ethereum".into(),
            },
            stored.updated_at,
        )
        .await
        .unwrap();

    feed_price(&h.cache, "ETH_USDC", px(2000));
    assert_eq!(run_tick(&h).await, 1);

    let stored = h.store.order("ord-small").await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.executed_amount, px(305));
    let history = h.store.execution_history("ord-small").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].amount, px(55));
}

#[tokio::test]
async fn below_min_fill_waits_when_intervals_remain() {
    let h = harness(px(2000));
    // 150 / 2 = 75 per interval, below the 100 minimum: never enqueued
    let o = order("ord-wait", px(150), 2, 100, px(100));
    h.store.create_order(&o).await.unwrap();
    feed_price(&h.cache, "ETH_USDC", px(2000));

    assert_eq!(run_tick(&h).await, 0);
    assert_eq!(h.adapter.execution_count(), 0);
    assert!(h.store.execution_history("ord-wait").await.unwrap().is_empty());
}

#[tokio::test]
async fn post_trade_breach_records_and_parks_the_order() {
    let h = harness(px(2100));
    let o = order("ord-breach", px(1000), 4, 100, px(100));
    h.store.create_order(&o).await.unwrap();

    // pre-trade check passes (current == hint == 2000) but the venue
    // fills at 2100: 500 bps realised, far over the 100 bps tolerance
    feed_price(&h.cache, "ETH_USDC", px(2000));
    assert_eq!(run_tick(&h).await, 1);

    // the fill is recorded; settlement cannot be undone
    let history = h.store.execution_history("ord-breach").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, px(2100));
    assert_eq!(history[0].slippage_bps, Some(500));

    let stored = h.store.order("ord-breach").await.unwrap();
    assert_eq!(stored.executed_amount, px(250));
    assert!(stored.requires_review());

    // parked: later ticks skip it entirely
    rewind_interval(&h.store, "ord-breach", 301).await;
    feed_price(&h.cache, "ETH_USDC", px(2100));
    assert_eq!(run_tick(&h).await, 0);
    assert_eq!(h.adapter.execution_count(), 1);
}

#[tokio::test]
async fn chain_error_leaves_state_untouched_for_retry() {
    let h = harness(px(2000));
    let o = order("ord-chain", px(1000), 4, 100, px(100));
    h.store.create_order(&o).await.unwrap();
    feed_price(&h.cache, "ETH_USDC", px(2000));

    h.adapter.fail_execution.store(true, Ordering::SeqCst);
    assert_eq!(run_tick(&h).await, 1);
    let stored = h.store.order("ord-chain").await.unwrap();
    assert_eq!(stored.executed_amount, U256::zero());
    assert!(h.store.execution_history("ord-chain").await.unwrap().is_empty());

    // next tick is the retry mechanism
    h.adapter.fail_execution.store(false, Ordering::SeqCst);
    assert_eq!(run_tick(&h).await, 1);
    assert_eq!(h.store.execution_history("ord-chain").await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_attempts_on_one_interval_resolve_to_one_success() {
    let h = harness(px(2000));
    let o = order("ord-race", px(1000), 4, 100, px(100));
    h.store.create_order(&o).await.unwrap();
    feed_price(&h.cache, "ETH_USDC", px(2000));

    let request = |_n: u32| ExecutionRequest {
        order_id: "ord-race".into(),
        interval_number: 0,
        target_amount: px(250),
        max_slippage_bps: 100,
        price_hint: px(2000),
        respond_to: None,
    };

    let (a, b) = tokio::join!(
        h.engine.execute_interval(request(0)),
        h.engine.execute_interval(request(1)),
    );
    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1, "exactly one concurrent attempt may commit");

    let history = h.store.execution_history("ord-race").await.unwrap();
    assert_eq!(history.len(), 1);
    let stored = h.store.order("ord-race").await.unwrap();
    assert_eq!(stored.executed_amount, px(250));
}

#[tokio::test]
async fn weighted_average_tracks_mixed_prices() {
    let h = harness(px(2000));
    let o = order("ord-avg", px(1000), 4, 500, px(100));
    h.store.create_order(&o).await.unwrap();

    feed_price(&h.cache, "ETH_USDC", px(2000));
    assert_eq!(run_tick(&h).await, 1);
    rewind_interval(&h.store, "ord-avg", 301).await;

    h.adapter.set_price(px(2100));
    feed_price(&h.cache, "ETH_USDC", px(2100));
    assert_eq!(run_tick(&h).await, 1);

    let stored = h.store.order("ord-avg").await.unwrap();
    // (2000*250 + 2100*250) / 500 = 2050
    assert_eq!(stored.average_price, px(2050));

    let history = h.store.execution_history("ord-avg").await.unwrap();
    let mut value = U256::zero();
    let mut volume = U256::zero();
    for record in &history {
        value += record.price * record.amount / PRICE_SCALE;
        volume += record.amount;
    }
    assert_eq!(value * PRICE_SCALE / volume, stored.average_price);
}

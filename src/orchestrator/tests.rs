use super::*;
use crate::adapters::{
    ChainAdapter, ChainStatusInfo, CreateHtlcParams, ExecuteIntervalParams, ExecutionOutcome,
    HtlcState,
};
use crate::config::{
    ApiConfig, DatabaseConfig, MetricsConfig, OrchestratorConfig, TwapConfig,
};
use crate::model::{hash_secret, money::PRICE_SCALE};
use crate::store::MemoryStore;
use crate::twap::{PriceCache, PriceFeedAggregator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

fn px(n: u64) -> U256 {
    U256::from(n) * PRICE_SCALE
}

/// Scripted adapter: executes exactly what it is asked at a fixed price,
/// reports a fixed height, and remembers refunds.
struct TestAdapter {
    chain_id: String,
    height: AtomicU64,
    execution_price: U256,
    htlc_states: std::sync::Mutex<HashMap<String, HtlcState>>,
    refunded: std::sync::Mutex<Vec<String>>,
}

impl TestAdapter {
    fn new(chain_id: &str, height: u64, execution_price: U256) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            height: AtomicU64::new(height),
            execution_price,
            htlc_states: std::sync::Mutex::new(HashMap::new()),
            refunded: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChainAdapter for TestAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }
    fn name(&self) -> &str {
        "Test Chain"
    }
    async fn connect(&self) -> crate::error::Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> crate::error::Result<()> {
        Ok(())
    }
    async fn is_connected(&self) -> bool {
        true
    }
    async fn address(&self) -> crate::error::Result<String> {
        Ok("0xoperator".into())
    }
    async fn balance(&self, _token: &str) -> crate::error::Result<U256> {
        Ok(U256::zero())
    }
    async fn create_twap_order(
        &self,
        params: &crate::adapters::CreateTwapOrderParams,
    ) -> crate::error::Result<String> {
        Ok(params.order_id.clone())
    }
    async fn execute_twap_interval(
        &self,
        params: &ExecuteIntervalParams,
    ) -> crate::error::Result<ExecutionOutcome> {
        Ok(ExecutionOutcome {
            tx_hash: format!("0xtx-{}-{}", params.order_id, params.interval_number),
            executed_amount: params.amount,
            execution_price: self.execution_price,
            gas_used: 150_000,
        })
    }
    async fn cancel_order(&self, _order_id: &str) -> crate::error::Result<()> {
        Ok(())
    }
    async fn create_htlc(&self, params: &CreateHtlcParams) -> crate::error::Result<String> {
        Ok(format!("lock-{}", &params.hashed_secret[..8]))
    }
    async fn claim_htlc(&self, _address: &str, _secret: &str) -> crate::error::Result<String> {
        Ok("0xclaim".into())
    }
    async fn refund_htlc(&self, address: &str) -> crate::error::Result<String> {
        self.refunded.lock().unwrap().push(address.to_string());
        Ok("0xrefund".into())
    }
    async fn htlc_status(&self, address: &str) -> crate::error::Result<HtlcState> {
        self.htlc_states
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| crate::error::OrchestratorError::NotFound(format!("htlc {}", address)))
    }
    async fn current_price(&self, _pair: &str) -> crate::error::Result<Option<U256>> {
        Ok(None)
    }
    async fn twap_price(&self, _pair: &str, _w: u32) -> crate::error::Result<Option<U256>> {
        Ok(None)
    }
    async fn subscribe(
        &self,
        _sink: tokio::sync::broadcast::Sender<ChainEvent>,
    ) -> crate::error::Result<()> {
        Ok(())
    }
    async fn unsubscribe(&self) -> crate::error::Result<()> {
        Ok(())
    }
    async fn chain_status(&self) -> crate::error::Result<ChainStatusInfo> {
        Ok(ChainStatusInfo {
            chain_id: self.chain_id.clone(),
            name: "Test Chain".into(),
            healthy: true,
            last_block_height: self.height.load(Ordering::SeqCst),
            last_block_time: Some(Utc::now()),
            avg_block_time: None,
            gas_price: None,
            checked_at: Utc::now(),
        })
    }
}

fn test_settings() -> Settings {
    Settings {
        orchestrator: OrchestratorConfig {
            environment: "development".into(),
            supported_chains: vec!["ethereum".into(), "cosmos".into()],
            timeout_check_interval_secs: 60,
            stats_interval_secs: 30,
            timeout_height_buffer: 100,
        },
        database: DatabaseConfig {
            url: "postgres://unused".into(),
            max_connections: 25,
            min_connections: 5,
            max_lifetime_secs: 300,
            statement_timeout_secs: 5,
        },
        api: ApiConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        metrics: MetricsConfig {
            enabled: false,
            port: 0,
        },
        twap: TwapConfig {
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
        },
        chains: HashMap::new(),
        price_feeds: Default::default(),
    }
}

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    store: Arc<MemoryStore>,
    source: Arc<TestAdapter>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(TestAdapter::new("ethereum", 1_000, px(2000)));
    let target = Arc::new(TestAdapter::new("cosmos", 5_000, px(2000)));
    let registry = Arc::new(AdapterRegistry::with_adapters(vec![
        source.clone() as Arc<dyn ChainAdapter>,
        target as Arc<dyn ChainAdapter>,
    ]));
    let cache = Arc::new(PriceCache::new(std::time::Duration::from_secs(86_400)));
    let aggregator = Arc::new(PriceFeedAggregator::new(
        vec![],
        vec![],
        cache.clone(),
        store.clone() as Arc<dyn Store>,
        std::time::Duration::from_secs(60),
    ));
    let engine = Arc::new(Engine::new(
        test_settings().twap,
        store.clone() as Arc<dyn Store>,
        registry.clone(),
        cache,
        aggregator,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        test_settings(),
        store.clone() as Arc<dyn Store>,
        registry,
        engine,
    ));
    Fixture {
        orchestrator,
        store,
        source,
    }
}

fn order_request(id: &str) -> CreateOrderRequest {
    CreateOrderRequest {
        id: id.into(),
        user_address: "0xuser".into(),
        source_chain: "ethereum".into(),
        target_chain: "cosmos".into(),
        source_token: "ETH".into(),
        source_amount: px(1000),
        target_token: "USDC".into(),
        target_recipient: "cosmos1abc".into(),
        min_received: U256::zero(),
        window_minutes: 20,
        execution_intervals: 4,
        max_slippage_bps: 100,
        min_fill_size: px(100),
        mev_protection: true,
        hashed_secret: format!("0x{}", "11".repeat(32)),
        timeout_height: 2_000,
        timeout_timestamp: Utc::now().timestamp() + 3_600,
    }
}

#[tokio::test]
async fn create_order_persists_pending() {
    let f = fixture();
    let order = f.orchestrator.create_order(order_request("0xa1")).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.executed_amount, U256::zero());

    let stats = f.orchestrator.statistics().await;
    assert_eq!(stats.total_orders, 1);
    assert_eq!(stats.active_orders, 1);

    // duplicate id conflicts
    assert!(matches!(
        f.orchestrator.create_order(order_request("0xa1")).await,
        Err(OrchestratorError::Conflict(_))
    ));
}

#[tokio::test]
async fn create_order_enforces_height_buffer() {
    let f = fixture();
    // adapter height is 1000 and the buffer 100; 1001 is too tight
    let mut request = order_request("0xa2");
    request.timeout_height = 1_001;
    assert!(matches!(
        f.orchestrator.create_order(request).await,
        Err(OrchestratorError::Validation(_))
    ));

    let mut request = order_request("0xa2");
    request.timeout_height = 1_100;
    assert!(f.orchestrator.create_order(request).await.is_ok());
}

#[tokio::test]
async fn create_order_enforces_plan_bounds() {
    let f = fixture();

    let mut request = order_request("0xa3");
    request.execution_intervals = 1;
    assert!(matches!(
        f.orchestrator.create_order(request).await,
        Err(OrchestratorError::Validation(_))
    ));

    let mut request = order_request("0xa3");
    request.execution_intervals = 21;
    assert!(matches!(
        f.orchestrator.create_order(request).await,
        Err(OrchestratorError::Validation(_))
    ));

    let mut request = order_request("0xa3");
    request.window_minutes = 4;
    assert!(matches!(
        f.orchestrator.create_order(request).await,
        Err(OrchestratorError::Validation(_))
    ));

    let mut request = order_request("0xa3");
    request.max_slippage_bps = 1_001;
    assert!(matches!(
        f.orchestrator.create_order(request).await,
        Err(OrchestratorError::Validation(_))
    ));

    // smallest legal plan: W = 5, K = 2 (150s interval)
    let mut request = order_request("0xa3");
    request.window_minutes = 5;
    request.execution_intervals = 2;
    assert!(f.orchestrator.create_order(request).await.is_ok());
}

#[tokio::test]
async fn cancel_is_idempotent_and_guards_terminal_states() {
    let f = fixture();
    f.orchestrator.create_order(order_request("0xb1")).await.unwrap();

    let cancelled = f.orchestrator.cancel_order("0xb1", "0xuser").await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    // cancelling again is a no-op success
    let again = f.orchestrator.cancel_order("0xb1", "0xuser").await.unwrap();
    assert_eq!(again.status, OrderStatus::Cancelled);

    // only the owner may cancel
    assert!(matches!(
        f.orchestrator.cancel_order("0xb1", "0xmallory").await,
        Err(OrchestratorError::Unauthorized(_))
    ));

    // a completed order refuses cancellation
    let order = f.orchestrator.create_order(order_request("0xb2")).await.unwrap();
    let mut completed = order.clone();
    completed.executed_amount = completed.source_amount;
    completed.status = OrderStatus::Completed;
    f.store.update_order(&completed, order.updated_at).await.unwrap();
    assert!(matches!(
        f.orchestrator.cancel_order("0xb2", "0xuser").await,
        Err(OrchestratorError::Conflict(_))
    ));
}

fn claim_event(address: &str, secret_hex: &str) -> ChainEvent {
    let mut data = Map::new();
    data.insert("htlc_address".into(), address.into());
    data.insert("secret".into(), secret_hex.into());
    ChainEvent {
        chain_id: "ethereum".into(),
        event_type: EventType::HtlcClaimed,
        block_number: 1_234,
        tx_hash: "0xclaimtx".into(),
        timestamp: Utc::now(),
        data,
        log_index: Some(0),
    }
}

async fn seed_completed_order_with_htlc(f: &Fixture, secret: &[u8; 32]) -> (String, String) {
    let hashed = hex::encode(hash_secret(secret));
    let mut request = order_request("0xc1");
    request.hashed_secret = hashed.clone();
    let order = f.orchestrator.create_order(request).await.unwrap();

    let mut completed = order.clone();
    completed.executed_amount = completed.source_amount;
    completed.status = OrderStatus::Completed;
    f.store.update_order(&completed, order.updated_at).await.unwrap();

    let htlc = Htlc {
        address: "lock-claim".into(),
        order_id: order.id.clone(),
        hashed_secret: hashed,
        amount: px(1000),
        token: "ETH".into(),
        sender: "0xoperator".into(),
        receiver: "cosmos1abc".into(),
        timeout_height: 5_000,
        timeout_timestamp: Utc::now().timestamp() + 7_200,
        status: HtlcStatus::Active,
        chain_id: "ethereum".into(),
        created_at: Utc::now(),
        claimed_at: None,
        revealed_secret: None,
    };
    f.store.create_htlc(&htlc).await.unwrap();
    (order.id.clone(), htlc.address.clone())
}

#[tokio::test]
async fn htlc_claim_transitions_order_and_replays_are_noops() {
    let f = fixture();
    let secret = [7u8; 32];
    let (order_id, address) = seed_completed_order_with_htlc(&f, &secret).await;

    let event = claim_event(&address, &hex::encode(secret));
    f.orchestrator.dispatch(event.clone()).await.unwrap();

    let htlc = f.store.htlc(&address).await.unwrap();
    assert_eq!(htlc.status, HtlcStatus::Claimed);
    assert_eq!(htlc.revealed_secret.as_deref(), Some(hex::encode(secret).as_str()));

    let order = f.store.order(&order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Claimed);
    assert_eq!(f.orchestrator.statistics().await.successful_swaps, 1);

    // replaying the exact same event changes nothing
    f.orchestrator.dispatch(event).await.unwrap();
    assert_eq!(f.orchestrator.statistics().await.successful_swaps, 1);
    let order = f.store.order(&order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Claimed);
}

#[tokio::test]
async fn htlc_claim_rejects_wrong_secret() {
    let f = fixture();
    let secret = [7u8; 32];
    let (order_id, address) = seed_completed_order_with_htlc(&f, &secret).await;

    let event = claim_event(&address, &hex::encode([8u8; 32]));
    assert!(matches!(
        f.orchestrator.dispatch(event).await,
        Err(OrchestratorError::Validation(_))
    ));

    let htlc = f.store.htlc(&address).await.unwrap();
    assert_eq!(htlc.status, HtlcStatus::Active);
    let order = f.store.order(&order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(f.orchestrator.statistics().await.successful_swaps, 0);
}

#[tokio::test]
async fn timed_out_orders_expire_and_freeze() {
    let f = fixture();
    let mut request = order_request("0xd1");
    request.timeout_timestamp = Utc::now().timestamp() + 60;
    let order = f.orchestrator.create_order(request).await.unwrap();

    // not yet expired
    f.orchestrator.check_order_timeouts().await.unwrap();
    assert_eq!(
        f.store.order(&order.id).await.unwrap().status,
        OrderStatus::Pending
    );

    // push the deadline into the past
    let current = f.store.order(&order.id).await.unwrap();
    let mut past_deadline = current.clone();
    past_deadline.timeout_timestamp = Utc::now().timestamp() - 1;
    f.store
        .update_order(&past_deadline, current.updated_at)
        .await
        .unwrap();

    f.orchestrator.check_order_timeouts().await.unwrap();
    let expired = f.store.order(&order.id).await.unwrap();
    assert_eq!(expired.status, OrderStatus::Expired);
    assert_eq!(expired.executed_amount, U256::zero());

    // terminal: no longer executable
    let executable = f.store.executable_orders(Utc::now()).await.unwrap();
    assert!(executable.iter().all(|o| o.id != order.id));

    let stats = f.orchestrator.statistics().await;
    assert_eq!(stats.failed_orders, 1);
}

#[tokio::test]
async fn refund_monitor_reclaims_expired_locks() {
    let f = fixture();
    let htlc = Htlc {
        address: "lock-refund".into(),
        order_id: String::new(),
        hashed_secret: "22".repeat(32),
        amount: px(10),
        token: "ETH".into(),
        sender: "0xoperator".into(),
        receiver: "0xother".into(),
        // adapter height is 1000
        timeout_height: 900,
        timeout_timestamp: 0,
        status: HtlcStatus::Active,
        chain_id: "ethereum".into(),
        created_at: Utc::now(),
        claimed_at: None,
        revealed_secret: None,
    };
    f.store.create_htlc(&htlc).await.unwrap();

    // a second lock that has not reached its height timeout yet
    let mut pending = htlc.clone();
    pending.address = "lock-pending".into();
    pending.timeout_height = 5_000;
    f.store.create_htlc(&pending).await.unwrap();

    f.orchestrator.check_htlc_refunds().await.unwrap();

    assert_eq!(
        f.store.htlc("lock-refund").await.unwrap().status,
        HtlcStatus::Refunded
    );
    assert_eq!(
        f.store.htlc("lock-pending").await.unwrap().status,
        HtlcStatus::Active
    );
    assert_eq!(
        *f.source.refunded.lock().unwrap(),
        vec!["lock-refund".to_string()]
    );
}

#[tokio::test]
async fn unknown_event_types_are_ignored() {
    let f = fixture();
    let event = ChainEvent {
        chain_id: "ethereum".into(),
        event_type: EventType::parse("governance_vote"),
        block_number: 1,
        tx_hash: String::new(),
        timestamp: Utc::now(),
        data: Map::new(),
        log_index: None,
    };
    assert!(f.orchestrator.dispatch(event).await.is_ok());
}

#[tokio::test]
async fn block_events_refresh_chain_status() {
    let f = fixture();
    let mut data = Map::new();
    data.insert("height".into(), serde_json::Value::from(4_242u64));
    let event = ChainEvent {
        chain_id: "ethereum".into(),
        event_type: EventType::BlockCreated,
        block_number: 4_242,
        tx_hash: String::new(),
        timestamp: Utc::now(),
        data,
        log_index: None,
    };
    f.orchestrator.dispatch(event).await.unwrap();

    let status = f.store.chain_status("ethereum").await.unwrap();
    assert_eq!(status.last_block_height, Some(4_242));
    assert_eq!(status.health, ChainHealth::Healthy);
}

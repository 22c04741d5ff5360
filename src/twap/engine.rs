//! TWAP engine: scheduling and execution
//!
//! Four loops cooperate under one stop signal: the price feed driver, the
//! scheduler that sizes and enqueues due intervals, the executor worker
//! draining the bounded queue, and a metrics tick. The queue's capacity
//! is the back-pressure mechanism — when it is full the scheduler drops
//! the enqueue and the next tick re-evaluates the order.

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterRegistry, ExecuteIntervalParams, ExecutionOutcome};
use crate::config::TwapConfig;
use crate::error::{OrchestratorError, Result};
use crate::metrics;
use crate::model::{money::slippage_bps, ExecutionRecord, Order, OrderStatus};
use crate::store::Store;

use super::feed::PriceFeedAggregator;
use super::price_cache::PriceCache;

/// How long the executor gets to finish in-flight work on shutdown
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// How often stored price points are pruned
const PRUNE_EVERY: Duration = Duration::from_secs(3600);

/// A sized interval waiting for execution
pub struct ExecutionRequest {
    pub order_id: String,
    pub interval_number: u32,
    pub target_amount: U256,
    pub max_slippage_bps: u32,
    /// TWAP over the order's window at schedule time; zero when the cache
    /// had no data, in which case execution proceeds unchecked
    pub price_hint: U256,
    pub respond_to: Option<oneshot::Sender<Result<ExecutionOutcome>>>,
}

/// Internal performance counters, exposed via the status API
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time_ms: f64,
    pub average_slippage_bps: f64,
    pub total_volume_executed: U256,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl EngineMetrics {
    fn record_success(&mut self, elapsed: Duration, slippage: u32, volume: U256) {
        self.total_executions += 1;
        self.successful_executions += 1;
        self.last_execution_at = Some(Utc::now());
        self.total_volume_executed = self.total_volume_executed.saturating_add(volume);

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if self.successful_executions == 1 {
            self.average_execution_time_ms = elapsed_ms;
            self.average_slippage_bps = slippage as f64;
        } else {
            // exponential moving average, alpha = 0.1
            self.average_execution_time_ms =
                self.average_execution_time_ms * 0.9 + elapsed_ms * 0.1;
            self.average_slippage_bps = self.average_slippage_bps * 0.9 + slippage as f64 * 0.1;
        }
    }

    fn record_failure(&mut self) {
        self.total_executions += 1;
        self.failed_executions += 1;
    }
}

pub struct Engine {
    config: TwapConfig,
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    cache: Arc<PriceCache>,
    aggregator: Arc<PriceFeedAggregator>,
    queue_tx: mpsc::Sender<ExecutionRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<ExecutionRequest>>>,
    stop_tx: watch::Sender<bool>,
    metrics: RwLock<EngineMetrics>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: TwapConfig,
        store: Arc<dyn Store>,
        registry: Arc<AdapterRegistry>,
        cache: Arc<PriceCache>,
        aggregator: Arc<PriceFeedAggregator>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.execution_queue_capacity);
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            registry,
            cache,
            aggregator,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stop_tx,
            metrics: RwLock::new(EngineMetrics::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> Arc<PriceCache> {
        self.cache.clone()
    }

    /// Spawn the engine's loops. Idempotent only across stop/start pairs.
    pub async fn start(self: &Arc<Self>) {
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            warn!("engine already started; ignoring");
            return;
        };
        let mut handles = self.handles.lock().await;

        // Price feed driver
        {
            let engine = self.clone();
            let mut stop = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(engine.config.price_update_interval());
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut last_prune = Instant::now();
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tick.tick() => {
                            if let Err(e) = engine.aggregator.poll_once().await {
                                error!(error = %e, "price feed update failed");
                            }
                            if last_prune.elapsed() >= PRUNE_EVERY {
                                let retention = Duration::from_secs(
                                    engine.config.price_retention_hours * 3600,
                                );
                                engine.aggregator.prune(retention).await;
                                last_prune = Instant::now();
                            }
                        }
                    }
                }
                debug!("price feed loop stopped");
            }));
        }

        // Scheduler
        {
            let engine = self.clone();
            let mut stop = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(engine.config.update_interval());
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tick.tick() => {
                            if let Err(e) = engine.process_executable_orders().await {
                                error!(error = %e, "failed to process executable orders");
                            }
                        }
                    }
                }
                debug!("scheduler loop stopped");
            }));
        }

        // Executor worker
        {
            let engine = self.clone();
            let mut stop = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        request = queue_rx.recv() => {
                            match request {
                                Some(request) => engine.handle_request(request).await,
                                None => break,
                            }
                        }
                    }
                }
                debug!("executor loop stopped");
            }));
        }

        // Metrics tick
        {
            let engine = self.clone();
            let mut stop = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tick.tick() => {
                            let snapshot = engine.metrics().await;
                            metrics::record_queue_depth(
                                engine.config.execution_queue_capacity
                                    - engine.queue_tx.capacity(),
                            );
                            debug!(
                                total = snapshot.total_executions,
                                ok = snapshot.successful_executions,
                                failed = snapshot.failed_executions,
                                avg_ms = snapshot.average_execution_time_ms,
                                "engine metrics"
                            );
                        }
                    }
                }
            }));
        }

        info!("TWAP engine started");
    }

    /// Signal all loops and wait for the executor to drain in-flight work
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let mut handles = self.handles.lock().await;
        for mut handle in handles.drain(..) {
            if tokio::time::timeout(DRAIN_DEADLINE, &mut handle).await.is_err() {
                warn!("engine task did not drain within deadline; aborting");
                handle.abort();
            }
        }
        info!("TWAP engine stopped");
    }

    /// One scheduler tick: find due orders, size their intervals, enqueue.
    pub async fn process_executable_orders(&self) -> Result<()> {
        let now = Utc::now();
        let orders = self.store.executable_orders(now).await?;
        debug!(count = orders.len(), "processing executable orders");

        // One height read per source chain per tick
        let mut heights: HashMap<String, Option<u64>> = HashMap::new();

        for order in orders {
            if order.requires_review() {
                debug!(order_id = %order.id, "order parked for slippage review");
                continue;
            }

            let height = match heights.get(&order.source_chain) {
                Some(cached) => *cached,
                None => {
                    let height = match self.registry.adapter(&order.source_chain) {
                        Ok(adapter) => match adapter.chain_status().await {
                            Ok(status) => Some(status.last_block_height),
                            Err(e) => {
                                warn!(
                                    chain_id = %order.source_chain,
                                    error = %e,
                                    "height unavailable; scheduling without height gate"
                                );
                                None
                            }
                        },
                        Err(e) => {
                            warn!(chain_id = %order.source_chain, error = %e, "no adapter");
                            None
                        }
                    };
                    heights.insert(order.source_chain.clone(), height);
                    height
                }
            };
            if let Some(height) = height {
                if order.is_height_expired(height) {
                    debug!(
                        order_id = %order.id,
                        height,
                        timeout_height = order.timeout_height,
                        "past timeout height; leaving to the timeout monitor"
                    );
                    continue;
                }
            }

            if let Err(e) = self.schedule_order(&order).await {
                error!(order_id = %order.id, error = %e, "failed to schedule order");
            }
        }

        Ok(())
    }

    /// Size the next interval for one order and enqueue it
    async fn schedule_order(&self, order: &Order) -> Result<()> {
        let history = self.store.execution_history(&order.id).await?;
        let executed_intervals = history.len() as u32;

        if executed_intervals >= order.execution_intervals {
            // All intervals spent; completion (or expiry) is someone
            // else's transition to make.
            debug!(order_id = %order.id, "no intervals remaining");
            return Ok(());
        }

        let remaining = order.remaining_amount();
        if remaining.is_zero() {
            return Ok(());
        }
        let remaining_intervals = order.execution_intervals - executed_intervals;

        let Some(target) = interval_target(remaining, remaining_intervals, order.min_fill_size)
        else {
            debug!(
                order_id = %order.id,
                remaining = %remaining,
                remaining_intervals,
                "interval below minimum fill size; waiting"
            );
            return Ok(());
        };

        let price_hint = self.cache.twap(&order.token_pair(), order.window_minutes);

        let request = ExecutionRequest {
            order_id: order.id.clone(),
            interval_number: executed_intervals,
            target_amount: target,
            max_slippage_bps: order.max_slippage_bps,
            price_hint,
            respond_to: None,
        };

        match self.queue_tx.try_send(request) {
            Ok(()) => {
                debug!(
                    order_id = %order.id,
                    interval = executed_intervals,
                    amount = %target,
                    "interval enqueued"
                );
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(order_id = %order.id, "execution queue full; dropping enqueue");
                metrics::record_queue_drop();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(OrchestratorError::Internal("execution queue closed".into()));
            }
        }
        Ok(())
    }

    /// Execute one queued request and answer its response channel
    pub async fn handle_request(&self, mut request: ExecutionRequest) {
        let order_id = request.order_id.clone();
        let respond_to = request.respond_to.take();
        let result = self.execute_interval(request).await;

        if let Err(e) = &result {
            if e.is_retryable() {
                warn!(order_id = %order_id, error = %e, "interval failed; next tick retries");
            } else {
                error!(order_id = %order_id, error = %e, "interval failed");
            }
        }
        if let Some(tx) = respond_to {
            let _ = tx.send(result);
        }
    }

    /// Validate, submit, and commit a single TWAP interval.
    pub async fn execute_interval(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        info!(
            order_id = %request.order_id,
            interval = request.interval_number,
            amount = %request.target_amount,
            "executing TWAP interval"
        );

        // Fresh working copy; the version it carries guards the commit.
        let order = self.store.order(&request.order_id).await?;
        let expected_version = order.updated_at;

        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Executing) {
            return Err(OrchestratorError::Conflict(format!(
                "order {} is {}",
                order.id, order.status
            )));
        }
        if order.requires_review() {
            return Err(OrchestratorError::Conflict(format!(
                "order {} awaits slippage review",
                order.id
            )));
        }

        let adapter = self.registry.adapter(&order.target_chain)?;
        let pair = order.token_pair();

        // Pre-trade gate: TWAP vs current must stay within the order's
        // tolerance. No TWAP data means no gate.
        if !request.price_hint.is_zero() {
            let current = match self.cache.latest(&pair) {
                Ok(point) => point.price,
                Err(_) => match adapter.current_price(&pair).await {
                    Ok(Some(price)) => price,
                    _ => {
                        warn!(pair = %pair, "no current price; validating against the hint only");
                        request.price_hint
                    }
                },
            };
            let slippage = slippage_bps(request.price_hint, current);
            if slippage > request.max_slippage_bps {
                self.metrics.write().await.record_failure();
                metrics::record_interval_failure("slippage_exceeded");
                return Err(OrchestratorError::SlippageExceeded {
                    slippage_bps: slippage,
                    max_bps: request.max_slippage_bps,
                });
            }
        }

        let outcome = match adapter
            .execute_twap_interval(&ExecuteIntervalParams {
                order_id: order.id.clone(),
                interval_number: request.interval_number,
                amount: request.target_amount,
                max_slippage_bps: request.max_slippage_bps,
                price_hint: request.price_hint,
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.write().await.record_failure();
                metrics::record_interval_failure("chain_error");
                return Err(e);
            }
        };

        let actual_slippage = if request.price_hint.is_zero() {
            0
        } else {
            slippage_bps(request.price_hint, outcome.execution_price)
        };

        let now = Utc::now();
        let mut updated = order.clone();
        updated.apply_fill(outcome.executed_amount, outcome.execution_price, now);

        // Post-trade breach: the fill happened and must be recorded, but
        // the order is parked until an operator clears it.
        if actual_slippage > request.max_slippage_bps {
            warn!(
                order_id = %order.id,
                slippage_bps = actual_slippage,
                max_bps = request.max_slippage_bps,
                "post-trade slippage breach; order parked for review"
            );
            updated.flag_for_review(actual_slippage);
            metrics::record_interval_failure("post_trade_slippage");
        }

        let record = ExecutionRecord {
            order_id: order.id.clone(),
            interval_number: request.interval_number,
            timestamp: now,
            amount: outcome.executed_amount,
            price: outcome.execution_price,
            gas_used: Some(outcome.gas_used),
            slippage_bps: Some(actual_slippage),
            tx_hash: Some(outcome.tx_hash.clone()),
            chain_id: order.target_chain.clone(),
        };

        if let Err(e) = self
            .store
            .record_execution(&updated, &record, expected_version)
            .await
        {
            // The trade settled on-chain but the record did not land.
            // Everything an operator needs to reconcile goes to the log.
            self.metrics.write().await.record_failure();
            metrics::record_interval_failure("store_error");
            error!(
                order_id = %order.id,
                interval = request.interval_number,
                amount = %outcome.executed_amount,
                price = %outcome.execution_price,
                tx_hash = %outcome.tx_hash,
                chain_id = %order.target_chain,
                error = %e,
                "CRITICAL: execution settled on-chain but the store write failed; manual reconciliation required"
            );
            return Err(e.into());
        }

        self.metrics
            .write()
            .await
            .record_success(started.elapsed(), actual_slippage, outcome.executed_amount);
        metrics::record_interval_executed(&order.target_chain, actual_slippage);

        info!(
            order_id = %order.id,
            interval = request.interval_number,
            executed = %outcome.executed_amount,
            price = %outcome.execution_price,
            slippage_bps = actual_slippage,
            tx_hash = %outcome.tx_hash,
            completed = updated.status == OrderStatus::Completed,
            "TWAP interval executed"
        );

        Ok(outcome)
    }

    /// Execute the next interval of an order immediately, bypassing the
    /// scheduler tick. Debug/testing surface.
    pub async fn execute_order_manually(&self, order_id: &str) -> Result<ExecutionOutcome> {
        let order = self.store.order(order_id).await?;
        let history = self.store.execution_history(order_id).await?;
        let executed_intervals = history.len() as u32;

        if executed_intervals >= order.execution_intervals {
            return Err(OrchestratorError::Conflict(format!(
                "order {} already fully executed",
                order_id
            )));
        }

        let remaining = order.remaining_amount();
        let remaining_intervals = order.execution_intervals - executed_intervals;
        let target = if remaining_intervals == 1 {
            remaining
        } else {
            remaining / U256::from(remaining_intervals)
        };

        let (respond_tx, respond_rx) = oneshot::channel();
        let request = ExecutionRequest {
            order_id: order_id.to_string(),
            interval_number: executed_intervals,
            target_amount: target,
            max_slippage_bps: order.max_slippage_bps,
            price_hint: self.cache.twap(&order.token_pair(), order.window_minutes),
            respond_to: Some(respond_tx),
        };

        self.queue_tx
            .try_send(request)
            .map_err(|_| OrchestratorError::Internal("execution queue full".into()))?;

        respond_rx
            .await
            .map_err(|_| OrchestratorError::Internal("executor dropped the request".into()))?
    }

    /// Drain whatever is currently queued, inline. Only usable before
    /// `start` has claimed the receiver; deterministic test surface.
    pub async fn drain_queued(&self) -> usize {
        let mut guard = self.queue_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(request) = rx.try_recv() {
            self.handle_request(request).await;
            handled += 1;
        }
        handled
    }

    pub async fn metrics(&self) -> EngineMetrics {
        self.metrics.read().await.clone()
    }

    pub fn twap_price(&self, token_pair: &str, window_minutes: u32) -> U256 {
        self.cache.twap(token_pair, window_minutes)
    }

    pub fn current_price(&self, token_pair: &str) -> Result<U256> {
        self.cache.latest(token_pair).map(|p| p.price)
    }
}

/// Target size for the next interval.
///
/// `remaining / intervals_left` in integer division; `None` when that is
/// below the minimum fill size and more than one interval remains. The
/// closing interval always takes the full remainder, dust included.
pub fn interval_target(remaining: U256, intervals_left: u32, min_fill: U256) -> Option<U256> {
    if intervals_left <= 1 {
        return Some(remaining);
    }
    let target = remaining / U256::from(intervals_left);
    if target < min_fill {
        None
    } else {
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: u64) -> U256 {
        U256::from(n) * U256::exp10(18)
    }

    #[test]
    fn interval_target_divides_evenly() {
        assert_eq!(
            interval_target(units(1000), 4, units(100)),
            Some(units(250))
        );
    }

    #[test]
    fn interval_target_skips_below_min_fill() {
        // 150 / 2 = 75 < 100 with more than one interval left
        assert_eq!(interval_target(units(150), 2, units(100)), None);
    }

    #[test]
    fn closing_interval_takes_dust() {
        // last interval executes the remainder even below min fill
        assert_eq!(interval_target(units(3), 1, units(100)), Some(units(3)));
        assert_eq!(interval_target(U256::zero(), 1, units(100)), Some(U256::zero()));
    }

    #[test]
    fn interval_target_truncates_toward_zero() {
        // 305 / 3 = 101.67 -> 101
        assert_eq!(
            interval_target(units(305), 3, units(100)),
            Some(units(305) / U256::from(3u64))
        );
    }

    #[test]
    fn metrics_ema_seeds_then_smooths() {
        let mut m = EngineMetrics::default();
        m.record_success(Duration::from_millis(100), 20, units(1));
        assert_eq!(m.average_execution_time_ms, 100.0);
        assert_eq!(m.average_slippage_bps, 20.0);

        m.record_success(Duration::from_millis(200), 40, units(1));
        assert!((m.average_execution_time_ms - 110.0).abs() < 1e-9);
        assert!((m.average_slippage_bps - 22.0).abs() < 1e-9);
        assert_eq!(m.successful_executions, 2);
        assert_eq!(m.total_volume_executed, units(2));

        m.record_failure();
        assert_eq!(m.total_executions, 3);
        assert_eq!(m.failed_executions, 1);
    }
}

//! Top-level supervisor
//!
//! Connects the adapter registry, routes chain events to their handlers,
//! expires timed-out orders, reclaims refundable HTLCs, and keeps the
//! process-wide statistics. Event handlers are idempotent: replaying any
//! event leaves the store unchanged.

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{
    AdapterRegistry, ChainEvent, CreateTwapOrderParams, CrossChainSwapParams,
    CrossChainSwapResult, EventType, HtlcPairError,
};
use crate::config::Settings;
use crate::error::{OrchestratorError, Result};
use crate::metrics;
use crate::model::{
    htlc::verify_secret, ChainHealth, ChainStatusRecord, Htlc, HtlcStatus, Order, OrderStatus,
};
use crate::store::{Store, StoreError};
use crate::twap::Engine;

/// Process-wide counters, served by the status API
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub total_orders: u64,
    pub active_orders: u64,
    pub completed_orders: u64,
    pub failed_orders: u64,
    pub cross_chain_swaps: u64,
    pub successful_swaps: u64,
    pub average_process_time_ms: f64,
    pub last_processed_order: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
}

/// An order creation request as the (out-of-scope) API layer hands it in
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub id: String,
    pub user_address: String,
    pub source_chain: String,
    pub target_chain: String,
    pub source_token: String,
    pub source_amount: U256,
    pub target_token: String,
    pub target_recipient: String,
    pub min_received: U256,
    pub window_minutes: u32,
    pub execution_intervals: u32,
    /// Zero selects the configured default
    pub max_slippage_bps: u32,
    pub min_fill_size: U256,
    pub mev_protection: bool,
    pub hashed_secret: String,
    pub timeout_height: u64,
    pub timeout_timestamp: i64,
}

/// Read-only projection of an order for display
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub id: String,
    pub status: OrderStatus,
    pub display_status: OrderStatus,
    pub source_amount: U256,
    pub executed_amount: U256,
    pub average_price: U256,
    pub completion_rate: f64,
    pub intervals_executed: u32,
    pub total_intervals: u32,
    pub last_execution: Option<DateTime<Utc>>,
}

pub struct Orchestrator {
    settings: Settings,
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    engine: Arc<Engine>,
    stats: RwLock<Statistics>,
    started_at: DateTime<Utc>,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        registry: Arc<AdapterRegistry>,
        engine: Arc<Engine>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            settings,
            store,
            registry,
            engine,
            stats: RwLock::new(Statistics::default()),
            started_at: Utc::now(),
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> Arc<AdapterRegistry> {
        self.registry.clone()
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    /// Connect everything and spawn the supervision loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("starting bridge orchestrator");

        self.registry.connect_all().await?;
        self.registry.subscribe_all().await?;
        self.engine.start().await;

        let mut handles = self.handles.lock().await;

        // Event dispatch
        {
            let orchestrator = self.clone();
            let mut stop = self.stop_tx.subscribe();
            let mut events = self.registry.subscribe_events();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        received = events.recv() => match received {
                            Ok(event) => {
                                metrics::record_event(&event.chain_id, event.event_type.as_str());
                                if let Err(e) = orchestrator.dispatch(event).await {
                                    error!(error = %e, "event handler failed");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "event dispatch lagging; events dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
                debug!("event dispatch loop stopped");
            }));
        }

        // Timeout / refund monitor
        {
            let orchestrator = self.clone();
            let mut stop = self.stop_tx.subscribe();
            let period = std::time::Duration::from_secs(
                self.settings.orchestrator.timeout_check_interval_secs,
            );
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tick.tick() => {
                            if let Err(e) = orchestrator.check_order_timeouts().await {
                                error!(error = %e, "order timeout scan failed");
                            }
                            if let Err(e) = orchestrator.check_htlc_refunds().await {
                                error!(error = %e, "HTLC refund scan failed");
                            }
                        }
                    }
                }
                debug!("timeout monitor stopped");
            }));
        }

        // Statistics updater
        {
            let orchestrator = self.clone();
            let mut stop = self.stop_tx.subscribe();
            let period =
                std::time::Duration::from_secs(self.settings.orchestrator.stats_interval_secs);
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tick.tick() => {
                            let mut stats = orchestrator.stats.write().await;
                            stats.uptime_seconds =
                                (Utc::now() - orchestrator.started_at).num_seconds();
                            debug!(
                                total = stats.total_orders,
                                active = stats.active_orders,
                                completed = stats.completed_orders,
                                uptime = stats.uptime_seconds,
                                "statistics"
                            );
                        }
                    }
                }
            }));
        }

        info!("bridge orchestrator running");
        Ok(())
    }

    /// Stop loops, then subsystems, adapters last. The store is closed by
    /// the caller once nothing can reach it anymore.
    pub async fn stop(&self) {
        info!("stopping bridge orchestrator");
        let _ = self.stop_tx.send(true);
        for handle in self.handles.lock().await.drain(..) {
            let _ = handle.await;
        }
        self.engine.stop().await;
        self.registry.unsubscribe_all().await;
        self.registry.disconnect_all().await;
        info!("bridge orchestrator stopped");
    }

    // ------------------------------------------------------------------
    // Order surface (consumed by the API layer)
    // ------------------------------------------------------------------

    /// Validate and register a new TWAP order
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order> {
        self.validate_order_request(&request)?;

        let source = self.registry.adapter(&request.source_chain)?;
        let status = source.chain_status().await?;
        let buffer = self.settings.orchestrator.timeout_height_buffer;
        if request.timeout_height < status.last_block_height + buffer {
            return Err(OrchestratorError::Validation(format!(
                "timeout_height {} must be at least {} blocks past the current height {}",
                request.timeout_height, buffer, status.last_block_height
            )));
        }

        let now = Utc::now();
        let order = Order {
            id: request.id.clone(),
            user_address: request.user_address.clone(),
            source_chain: request.source_chain.clone(),
            target_chain: request.target_chain.clone(),
            source_token: request.source_token.clone(),
            source_amount: request.source_amount,
            target_token: request.target_token.clone(),
            target_recipient: request.target_recipient.clone(),
            min_received: request.min_received,
            window_minutes: request.window_minutes,
            execution_intervals: request.execution_intervals,
            max_slippage_bps: if request.max_slippage_bps == 0 {
                self.settings.twap.default_slippage_bps
            } else {
                request.max_slippage_bps
            },
            min_fill_size: request.min_fill_size,
            mev_protection: request.mev_protection,
            hashed_secret: request.hashed_secret.clone(),
            timeout_height: request.timeout_height,
            timeout_timestamp: request.timeout_timestamp,
            created_at: now,
            updated_at: now,
            executed_amount: U256::zero(),
            last_execution: None,
            status: OrderStatus::Pending,
            average_price: U256::zero(),
            metadata: Map::new(),
        };

        source
            .create_twap_order(&CreateTwapOrderParams {
                order_id: order.id.clone(),
                user_address: order.user_address.clone(),
                source_token: order.source_token.clone(),
                target_token: order.target_token.clone(),
                amount: order.source_amount,
                min_received: order.min_received,
                window_minutes: order.window_minutes,
                intervals: order.execution_intervals,
                max_slippage_bps: order.max_slippage_bps,
                hashed_secret: order.hashed_secret.clone(),
                timeout_height: order.timeout_height,
                timeout_timestamp: order.timeout_timestamp,
            })
            .await?;

        if let Err(e) = self.store.create_order(&order).await {
            match e {
                StoreError::Duplicate(_) => {
                    return Err(OrchestratorError::Conflict(format!(
                        "order {} already exists",
                        order.id
                    )))
                }
                other => {
                    error!(
                        order_id = %order.id,
                        error = %other,
                        "CRITICAL: order registered on-chain but the store write failed"
                    );
                    return Err(other.into());
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.total_orders += 1;
        stats.active_orders += 1;
        metrics::record_order_created();

        info!(order_id = %order.id, user = %order.user_address, "order created");
        Ok(order)
    }

    fn validate_order_request(&self, request: &CreateOrderRequest) -> Result<()> {
        let twap = &self.settings.twap;

        if !self.registry.is_supported(&request.source_chain) {
            return Err(OrchestratorError::Validation(format!(
                "unsupported source chain {}",
                request.source_chain
            )));
        }
        if !self.registry.is_supported(&request.target_chain) {
            return Err(OrchestratorError::Validation(format!(
                "unsupported target chain {}",
                request.target_chain
            )));
        }
        if request.source_amount.is_zero() {
            return Err(OrchestratorError::Validation("source_amount must be positive".into()));
        }
        if request.min_fill_size.is_zero() {
            return Err(OrchestratorError::Validation("min_fill_size must be positive".into()));
        }
        if let Ok(floor) = U256::from_dec_str(&twap.min_liquidity) {
            if request.min_fill_size < floor {
                return Err(OrchestratorError::Validation(format!(
                    "min_fill_size below the configured liquidity floor {}",
                    twap.min_liquidity
                )));
            }
        }
        if request.window_minutes < twap.window_min || request.window_minutes > twap.window_max {
            return Err(OrchestratorError::Validation(format!(
                "window_minutes {} outside [{}, {}]",
                request.window_minutes, twap.window_min, twap.window_max
            )));
        }
        if !(2..=20).contains(&request.execution_intervals) {
            return Err(OrchestratorError::Validation(format!(
                "execution_intervals {} outside [2, 20]",
                request.execution_intervals
            )));
        }
        if request.max_slippage_bps > twap.max_slippage_bps {
            return Err(OrchestratorError::Validation(format!(
                "max_slippage_bps {} exceeds configured maximum {}",
                request.max_slippage_bps, twap.max_slippage_bps
            )));
        }
        let interval_secs =
            (request.window_minutes as u64 * 60) / request.execution_intervals as u64;
        if interval_secs < twap.min_execution_interval_secs
            || interval_secs > twap.max_execution_interval_secs
        {
            return Err(OrchestratorError::Validation(format!(
                "interval duration {}s outside [{}s, {}s]",
                interval_secs, twap.min_execution_interval_secs, twap.max_execution_interval_secs
            )));
        }
        let secret = request.hashed_secret.trim_start_matches("0x");
        if hex::decode(secret).map(|b| b.len() != 32).unwrap_or(true) {
            return Err(OrchestratorError::Validation(
                "hashed_secret must be 32 bytes of hex".into(),
            ));
        }
        if request.timeout_timestamp <= Utc::now().timestamp() {
            return Err(OrchestratorError::Validation(
                "timeout_timestamp is already in the past".into(),
            ));
        }
        Ok(())
    }

    /// Cancel an order on its owner's request. Cancelling an already
    /// cancelled order is a no-op; any other terminal state conflicts.
    pub async fn cancel_order(&self, order_id: &str, requester: &str) -> Result<Order> {
        let order = self.store.order(order_id).await.map_err(|e| match e {
            StoreError::NotFound => OrchestratorError::NotFound(format!("order {}", order_id)),
            other => other.into(),
        })?;

        if order.user_address != requester {
            return Err(OrchestratorError::Unauthorized(
                "only the order owner may cancel".into(),
            ));
        }

        match order.status {
            OrderStatus::Cancelled => Ok(order),
            OrderStatus::Pending | OrderStatus::Executing => {
                self.registry
                    .adapter(&order.source_chain)?
                    .cancel_order(order_id)
                    .await?;

                let mut cancelled = order.clone();
                cancelled.status = OrderStatus::Cancelled;
                let stored = self.store.update_order(&cancelled, order.updated_at).await?;

                let mut stats = self.stats.write().await;
                stats.active_orders = stats.active_orders.saturating_sub(1);
                info!(order_id = %order_id, "order cancelled");
                Ok(stored)
            }
            other => Err(OrchestratorError::Conflict(format!(
                "cannot cancel order in state {}",
                other
            ))),
        }
    }

    /// Display projection for one order
    pub async fn order_view(&self, order_id: &str) -> Result<OrderView> {
        let order = self.store.order(order_id).await.map_err(|e| match e {
            StoreError::NotFound => OrchestratorError::NotFound(format!("order {}", order_id)),
            other => other.into(),
        })?;
        let history = self.store.execution_history(order_id).await?;
        Ok(OrderView {
            id: order.id.clone(),
            status: order.status,
            display_status: order.display_status(),
            source_amount: order.source_amount,
            executed_amount: order.executed_amount,
            average_price: order.average_price,
            completion_rate: order.completion_rate(),
            intervals_executed: history.len() as u32,
            total_intervals: order.execution_intervals,
            last_execution: order.last_execution,
        })
    }

    /// Create the HTLC pair for a cross-chain swap and persist both legs.
    /// On a target-leg failure the source lock is still persisted active
    /// so the refund monitor reclaims it after its timeout.
    pub async fn execute_cross_chain_swap(
        &self,
        params: CrossChainSwapParams,
    ) -> Result<CrossChainSwapResult> {
        {
            let mut stats = self.stats.write().await;
            stats.cross_chain_swaps += 1;
        }

        match self.registry.create_htlc_pair(&params).await {
            Ok(result) => {
                let sender = self
                    .registry
                    .adapter(&params.source_chain)?
                    .address()
                    .await
                    .unwrap_or_default();
                self.persist_htlc_leg(&params, &result.source_htlc, &params.source_chain, &sender, params.amount, 0)
                    .await;
                self.persist_htlc_leg(
                    &params,
                    &result.target_htlc,
                    &params.target_chain,
                    &sender,
                    params.target_amount,
                    1,
                )
                .await;
                Ok(result)
            }
            Err(HtlcPairError::Target { source_htlc, cause }) => {
                let sender = self
                    .registry
                    .adapter(&params.source_chain)?
                    .address()
                    .await
                    .unwrap_or_default();
                self.persist_htlc_leg(&params, &source_htlc, &params.source_chain, &sender, params.amount, 0)
                    .await;
                Err(cause)
            }
            Err(HtlcPairError::Source(cause)) => Err(cause),
            Err(HtlcPairError::Invalid(cause)) => Err(cause),
        }
    }

    async fn persist_htlc_leg(
        &self,
        params: &CrossChainSwapParams,
        address: &str,
        chain_id: &str,
        sender: &str,
        amount: U256,
        leg: u8,
    ) {
        let (token, receiver, height, timestamp) = if leg == 0 {
            (
                params.source_token.clone(),
                params.target_recipient.clone(),
                params.timeout_height,
                params.timeout_timestamp,
            )
        } else {
            (
                params.target_token.clone(),
                params.source_user.clone(),
                params.timeout_height.saturating_sub(100),
                params.timeout_timestamp - 3600,
            )
        };
        let htlc = Htlc {
            address: address.to_string(),
            order_id: params.order_id.clone(),
            hashed_secret: params.hashed_secret.clone(),
            amount,
            token,
            sender: sender.to_string(),
            receiver,
            timeout_height: height,
            timeout_timestamp: timestamp,
            status: HtlcStatus::Active,
            chain_id: chain_id.to_string(),
            created_at: Utc::now(),
            claimed_at: None,
            revealed_secret: None,
        };
        if let Err(e) = self.store.create_htlc(&htlc).await {
            error!(address = %address, error = %e, "failed to persist HTLC leg");
        }
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Route one chain event to its handler. Unknown types are ignored.
    pub async fn dispatch(&self, event: ChainEvent) -> Result<()> {
        debug!(
            chain_id = %event.chain_id,
            event_type = %event.event_type,
            tx_hash = %event.tx_hash,
            "chain event"
        );

        match event.event_type {
            EventType::OrderCreated => self.handle_order_created(&event).await,
            EventType::OrderExecuted => self.handle_order_executed(&event).await,
            EventType::OrderCompleted => self.handle_order_completed(&event).await,
            EventType::OrderCancelled => self.handle_order_cancelled(&event).await,
            EventType::HtlcCreated => self.handle_htlc_created(&event).await,
            EventType::HtlcClaimed => self.handle_htlc_claimed(&event).await,
            EventType::HtlcRefunded => self.handle_htlc_refunded(&event).await,
            EventType::PriceUpdate => Ok(()),
            EventType::BlockCreated => self.handle_block_created(&event).await,
            EventType::Other(ref name) => {
                debug!(event_type = %name, "ignoring unknown event type");
                Ok(())
            }
        }
    }

    async fn handle_order_created(&self, event: &ChainEvent) -> Result<()> {
        info!(chain_id = %event.chain_id, tx_hash = %event.tx_hash, "order created on-chain");
        Ok(())
    }

    async fn handle_order_executed(&self, event: &ChainEvent) -> Result<()> {
        let Some(order_id) = event.data_str("order_id") else {
            return Err(OrchestratorError::Validation(
                "order_executed event missing order_id".into(),
            ));
        };
        let order = match self.store.order(order_id).await {
            Ok(order) => order,
            Err(StoreError::NotFound) => {
                debug!(order_id = %order_id, "execution event for unknown order");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // The engine's commit already moved the status; this only lifts a
        // still-pending order into executing when the chain saw the fill
        // first. Replays are no-ops.
        if order.status == OrderStatus::Pending {
            let mut updated = order.clone();
            updated.status = OrderStatus::Executing;
            match self.store.update_order(&updated, order.updated_at).await {
                Ok(_) => {}
                Err(StoreError::Conflict(_)) => {
                    debug!(order_id = %order_id, "lost the race to a concurrent update");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn handle_order_completed(&self, event: &ChainEvent) -> Result<()> {
        let mut stats = self.stats.write().await;
        stats.completed_orders += 1;
        stats.active_orders = stats.active_orders.saturating_sub(1);
        stats.last_processed_order = Some(Utc::now());

        if let Some(order_id) = event.data_str("order_id") {
            if let Ok(order) = self.store.order(order_id).await {
                let elapsed_ms = (Utc::now() - order.created_at).num_milliseconds() as f64;
                stats.average_process_time_ms = if stats.completed_orders == 1 {
                    elapsed_ms
                } else {
                    stats.average_process_time_ms * 0.9 + elapsed_ms * 0.1
                };
            }
        }
        Ok(())
    }

    async fn handle_order_cancelled(&self, event: &ChainEvent) -> Result<()> {
        let Some(order_id) = event.data_str("order_id") else {
            return Ok(());
        };
        let order = match self.store.order(order_id).await {
            Ok(order) => order,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Ok(());
        }
        let mut cancelled = order.clone();
        cancelled.status = OrderStatus::Cancelled;
        match self.store.update_order(&cancelled, order.updated_at).await {
            Ok(_) => {
                let mut stats = self.stats.write().await;
                stats.active_orders = stats.active_orders.saturating_sub(1);
                info!(order_id = %order_id, "order cancelled on-chain");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_htlc_created(&self, event: &ChainEvent) -> Result<()> {
        let Some(address) = event.data_str("htlc_address") else {
            return Err(OrchestratorError::Validation(
                "htlc_created event missing htlc_address".into(),
            ));
        };

        // Replay-safe: an already-tracked lock is left untouched.
        if self.store.htlc(address).await.is_ok() {
            debug!(address = %address, "HTLC already tracked");
            return Ok(());
        }

        let adapter = self.registry.adapter(&event.chain_id)?;
        let state = adapter.htlc_status(address).await?;

        let order_id = event
            .data_str("order_id")
            .map(str::to_string)
            .unwrap_or_default();
        if order_id.is_empty() {
            warn!(address = %address, "htlc_created event carried no order_id");
        }

        let htlc = Htlc {
            address: state.address.clone(),
            order_id,
            hashed_secret: state.hashed_secret.clone(),
            amount: state.amount,
            token: state.token.clone(),
            sender: state.sender.clone(),
            receiver: state.recipient.clone(),
            timeout_height: state.timeout_height,
            timeout_timestamp: state.timeout_timestamp,
            status: state.status,
            chain_id: event.chain_id.clone(),
            created_at: state.created_at,
            claimed_at: state.claimed_at,
            revealed_secret: state.secret.clone(),
        };
        let inserted = self.store.create_htlc(&htlc).await?;
        if inserted {
            metrics::record_htlc_transition("active");
            info!(address = %address, chain_id = %event.chain_id, "HTLC tracked");
        }
        Ok(())
    }

    async fn handle_htlc_claimed(&self, event: &ChainEvent) -> Result<()> {
        let Some(address) = event.data_str("htlc_address") else {
            return Err(OrchestratorError::Validation(
                "htlc_claimed event missing htlc_address".into(),
            ));
        };
        let Some(secret) = event.data_str("secret") else {
            return Err(OrchestratorError::Validation(
                "htlc_claimed event missing secret".into(),
            ));
        };

        let htlc = match self.store.htlc(address).await {
            Ok(htlc) => htlc,
            Err(StoreError::NotFound) => {
                warn!(address = %address, "claim event for unknown HTLC");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if htlc.status == HtlcStatus::Claimed {
            debug!(address = %address, "HTLC already claimed; replay ignored");
            return Ok(());
        }

        if !verify_secret(secret, &htlc.hashed_secret) {
            warn!(address = %address, "claim secret does not match commitment; ignoring");
            return Err(OrchestratorError::Validation(format!(
                "invalid claim secret for HTLC {}",
                address
            )));
        }

        let mut claimed = htlc.clone();
        claimed.mark_claimed(secret, Utc::now());
        self.store.update_htlc(&claimed).await?;
        metrics::record_htlc_transition("claimed");

        // Completed orders move to claimed once the secret is revealed.
        if !htlc.order_id.is_empty() {
            if let Ok(order) = self.store.order(&htlc.order_id).await {
                if order.status == OrderStatus::Completed {
                    let mut updated = order.clone();
                    updated.status = OrderStatus::Claimed;
                    match self.store.update_order(&updated, order.updated_at).await {
                        Ok(_) => {
                            info!(order_id = %order.id, "order claimed");
                        }
                        Err(StoreError::Conflict(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.successful_swaps += 1;
        info!(address = %address, "HTLC claimed");
        Ok(())
    }

    async fn handle_htlc_refunded(&self, event: &ChainEvent) -> Result<()> {
        let Some(address) = event.data_str("htlc_address") else {
            return Err(OrchestratorError::Validation(
                "htlc_refunded event missing htlc_address".into(),
            ));
        };
        let htlc = match self.store.htlc(address).await {
            Ok(htlc) => htlc,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if htlc.status != HtlcStatus::Active {
            return Ok(());
        }

        let mut refunded = htlc.clone();
        refunded.status = HtlcStatus::Refunded;
        self.store.update_htlc(&refunded).await?;
        metrics::record_htlc_transition("refunded");

        if !htlc.order_id.is_empty() {
            if let Ok(order) = self.store.order(&htlc.order_id).await {
                if order.status.can_transition_to(OrderStatus::Refunded) {
                    let mut updated = order.clone();
                    updated.status = OrderStatus::Refunded;
                    if let Err(e) = self.store.update_order(&updated, order.updated_at).await {
                        if !matches!(e, StoreError::Conflict(_)) {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        info!(address = %address, "HTLC refunded");
        Ok(())
    }

    async fn handle_block_created(&self, event: &ChainEvent) -> Result<()> {
        let height = event
            .data
            .get("height")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(event.block_number);
        let name = self
            .registry
            .adapter(&event.chain_id)
            .map(|a| a.name().to_string())
            .unwrap_or_else(|_| event.chain_id.clone());

        metrics::record_block_height(&event.chain_id, height);
        self.store
            .upsert_chain_status(&ChainStatusRecord {
                chain_id: event.chain_id.clone(),
                name,
                enabled: true,
                last_block_height: Some(height),
                last_block_time: Some(event.timestamp),
                avg_block_time: None,
                gas_price: None,
                health: ChainHealth::Healthy,
                last_health_check: Utc::now(),
            })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Monitors
    // ------------------------------------------------------------------

    /// Expire orders whose wall-clock deadline passed
    pub async fn check_order_timeouts(&self) -> Result<()> {
        let now = Utc::now();
        let orders = self.store.executable_orders(now).await?;

        for order in orders {
            if !order.is_timed_out(now) {
                continue;
            }
            info!(
                order_id = %order.id,
                timeout_timestamp = order.timeout_timestamp,
                "order timed out"
            );

            let mut expired = order.clone();
            expired.status = OrderStatus::Expired;
            match self.store.update_order(&expired, order.updated_at).await {
                Ok(_) => {
                    let mut stats = self.stats.write().await;
                    stats.failed_orders += 1;
                    stats.active_orders = stats.active_orders.saturating_sub(1);
                    metrics::record_order_expired();
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(order_id = %order.id, "expiry lost a concurrent update; next scan retries");
                }
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "failed to expire order");
                }
            }
        }
        Ok(())
    }

    /// Refund active HTLCs whose height timeout passed
    pub async fn check_htlc_refunds(&self) -> Result<()> {
        let active = self.store.htlcs_by_status(HtlcStatus::Active).await?;
        if active.is_empty() {
            return Ok(());
        }

        let mut heights: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        for htlc in active {
            let height = match heights.get(&htlc.chain_id) {
                Some(height) => *height,
                None => {
                    let adapter = match self.registry.adapter(&htlc.chain_id) {
                        Ok(adapter) => adapter,
                        Err(e) => {
                            warn!(chain_id = %htlc.chain_id, error = %e, "no adapter for refund scan");
                            continue;
                        }
                    };
                    match adapter.chain_status().await {
                        Ok(status) => {
                            heights.insert(htlc.chain_id.clone(), status.last_block_height);
                            status.last_block_height
                        }
                        Err(e) => {
                            warn!(chain_id = %htlc.chain_id, error = %e, "height unavailable for refund scan");
                            continue;
                        }
                    }
                }
            };

            if !htlc.refundable_at(height) {
                continue;
            }

            let adapter = self.registry.adapter(&htlc.chain_id)?;
            match adapter.refund_htlc(&htlc.address).await {
                Ok(tx_hash) => {
                    let mut refunded = htlc.clone();
                    refunded.status = HtlcStatus::Refunded;
                    if let Err(e) = self.store.update_htlc(&refunded).await {
                        error!(address = %htlc.address, error = %e, "refund submitted but store update failed");
                    } else {
                        metrics::record_htlc_transition("refunded");
                        info!(address = %htlc.address, tx_hash = %tx_hash, "HTLC refund submitted");
                    }
                }
                Err(e) => {
                    warn!(address = %htlc.address, error = %e, "HTLC refund failed; next scan retries");
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn statistics(&self) -> Statistics {
        let mut stats = self.stats.read().await.clone();
        stats.uptime_seconds = (Utc::now() - self.started_at).num_seconds();
        stats
    }

    /// Aggregate health of the store and every adapter
    pub async fn health_check(&self) -> serde_json::Value {
        let database = match self.store.health().await {
            Ok(()) => serde_json::json!({"status": "healthy"}),
            Err(e) => serde_json::json!({"status": "unhealthy", "error": e.to_string()}),
        };

        let mut adapters = serde_json::Map::new();
        for (chain_id, healthy) in self.registry.health_check_all().await {
            adapters.insert(
                chain_id,
                serde_json::json!({"status": if healthy { "healthy" } else { "unhealthy" }}),
            );
        }

        serde_json::json!({
            "database": database,
            "adapters": adapters,
            "statistics": self.statistics().await,
            "engine": self.engine.metrics().await,
        })
    }
}

#[cfg(test)]
mod tests;

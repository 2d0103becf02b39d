//! Progressive Execution Engine (C5): one engine per account, one `tokio::spawn`ed task per
//! `ManagedOrder`. A `tokio::select!`-multiplexed per-order step timer races against an
//! inbound control message, fed by a per-account `mpsc` mailbox the dispatcher writes to in
//! arrival order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch, Mutex};

use crate::broker::{BrokerGateway, CancelResult, PlaceOrderPrice, Side};
use crate::calc::{is_spread_reasonable, step_price};
use crate::errors::{EngineError, GatewayError};
use crate::notifier::{NotifyEvent, Notifier};
use crate::signal::OrderIntent;
use crate::store::{Action, DeltaRecord, DeltaStore};
use crate::utils::now_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Idle,
    Placing,
    Working,
    Stepping,
    Cancelling,
    Filled,
    Cancelled,
    MarketFallback,
    MarketPlaced,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ManagedOrder {
    pub intent: OrderIntent,
    pub broker_order_id: Option<String>,
    pub state: OrderState,
    pub current_limit: Option<Decimal>,
    pub step_index: u32,
    pub placed_at: Option<chrono::DateTime<Utc>>,
    pub last_transition_at: chrono::DateTime<Utc>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub cancel_reason: Option<String>,
    pub attempts: u32,
}

impl ManagedOrder {
    fn new(intent: OrderIntent) -> Self {
        Self {
            intent,
            broker_order_id: None,
            state: OrderState::Idle,
            current_limit: None,
            step_index: 0,
            placed_at: None,
            last_transition_at: now_utc(),
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            cancel_reason: None,
            attempts: 0,
        }
    }

    fn remaining(&self) -> Decimal {
        self.intent.size - self.filled_qty
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_steps: u32,
    pub step_interval: Duration,
    pub max_place_retries: u32,
    pub step_attempt_budget: u32,
    pub max_spread_holds: u32,
    pub force_progress: bool,
    pub enable_market_fallback: bool,
    pub max_spread_ratio: Decimal,
    pub max_spread_ticks: Decimal,
    pub post_fill_cancel_budget: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            step_interval: Duration::from_secs(8),
            max_place_retries: 3,
            step_attempt_budget: 3,
            max_spread_holds: 3,
            force_progress: false,
            enable_market_fallback: false,
            max_spread_ratio: dec!(0.15),
            max_spread_ticks: dec!(2),
            post_fill_cancel_budget: Duration::from_secs(3),
        }
    }
}

pub enum EngineCommand {
    Submit(OrderIntent),
    CancelInstrument { instrument_id: String, reason: String },
    /// C6's order-loop nudge: a managed order has no matching broker record.
    ReconcileMissing { instrument_id: String },
    Shutdown,
}

/// Per-account engine. Owns one `tokio::spawn`ed worker per `instrument_id`; intents for the
/// same instrument are serialized through that worker's mailbox, distinct instruments run in
/// parallel tasks.
pub struct AccountEngine {
    account_id: String,
    gateway: Arc<dyn BrokerGateway>,
    store: DeltaStore,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    workers: Mutex<std::collections::HashMap<String, mpsc::Sender<EngineCommand>>>,
    shutdown_rx: watch::Receiver<bool>,
    snapshots: Arc<std::sync::RwLock<std::collections::HashMap<String, ManagedOrder>>>,
}

impl AccountEngine {
    pub fn new(
        account_id: String,
        gateway: Arc<dyn BrokerGateway>,
        store: DeltaStore,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            account_id,
            gateway,
            store,
            notifier,
            config,
            workers: Mutex::new(std::collections::HashMap::new()),
            shutdown_rx,
            snapshots: Arc::new(std::sync::RwLock::new(std::collections::HashMap::new())),
        }
    }

    /// Hands an intent to the owning per-instrument worker, spawning it if this is the first
    /// intent seen for that instrument.
    pub async fn submit(&self, intent: OrderIntent) -> Result<(), EngineError> {
        let instrument_id = intent.instrument_id.clone();
        let mut workers = self.workers.lock().await;
        let sender = match workers.get(&instrument_id) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let (tx, rx) = mpsc::channel(32);
                let worker = OrderWorker {
                    account_id: self.account_id.clone(),
                    instrument_id: instrument_id.clone(),
                    gateway: self.gateway.clone(),
                    store: self.store.clone(),
                    notifier: self.notifier.clone(),
                    config: self.config.clone(),
                    shutdown_rx: self.shutdown_rx.clone(),
                    snapshots: self.snapshots.clone(),
                };
                tokio::spawn(worker.run(rx));
                workers.insert(instrument_id.clone(), tx.clone());
                tx
            }
        };
        drop(workers);
        sender
            .send(EngineCommand::Submit(intent))
            .await
            .map_err(|_| EngineError::BadSignal("order worker mailbox closed".to_string()))
    }

    pub async fn request_cancel(&self, instrument_id: &str, reason: &str) {
        let workers = self.workers.lock().await;
        if let Some(tx) = workers.get(instrument_id) {
            let _ = tx
                .send(EngineCommand::CancelInstrument { instrument_id: instrument_id.to_string(), reason: reason.to_string() })
                .await;
        }
    }

    pub async fn reconcile_missing(&self, instrument_id: &str) {
        let workers = self.workers.lock().await;
        if let Some(tx) = workers.get(instrument_id) {
            let _ = tx.send(EngineCommand::ReconcileMissing { instrument_id: instrument_id.to_string() }).await;
        }
    }

    pub fn snapshot(&self, instrument_id: &str) -> Option<ManagedOrder> {
        self.snapshots.read().unwrap().get(instrument_id).cloned()
    }

    pub async fn shutdown(&self) {
        let workers = self.workers.lock().await;
        for tx in workers.values() {
            let _ = tx.send(EngineCommand::Shutdown).await;
        }
    }
}

struct OrderWorker {
    account_id: String,
    instrument_id: String,
    gateway: Arc<dyn BrokerGateway>,
    store: DeltaStore,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    shutdown_rx: watch::Receiver<bool>,
    snapshots: Arc<std::sync::RwLock<std::collections::HashMap<String, ManagedOrder>>>,
}

impl OrderWorker {
    fn publish(&self, order: &ManagedOrder) {
        self.snapshots.write().unwrap().insert(self.instrument_id.clone(), order.clone());
    }

    async fn run(self, mut rx: mpsc::Receiver<EngineCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                EngineCommand::Submit(intent) => {
                    let mut order = ManagedOrder::new(intent);
                    self.publish(&order);
                    self.drive(&mut order, &mut rx).await;
                }
                EngineCommand::CancelInstrument { .. } => {
                    // No order in flight; nothing to cancel.
                }
                EngineCommand::ReconcileMissing { .. } => {}
                EngineCommand::Shutdown => break,
            }
        }
    }

    /// Runs a `ManagedOrder` to a terminal state, implementing the full transition table
    /// end to end for this one order.
    async fn drive(&self, order: &mut ManagedOrder, rx: &mut mpsc::Receiver<EngineCommand>) {
        loop {
            // Once a state transition has already decided to cancel or has reached a
            // terminal outcome, let it run to completion instead of re-intercepting it here.
            // `work_step`'s own shutdown branch hands off into `Cancelling`, and only the
            // `Cancelling` match arm below actually issues the broker cancel.
            let already_settling = matches!(
                order.state,
                OrderState::Cancelling | OrderState::Filled | OrderState::Cancelled | OrderState::Failed
            );
            if *self.shutdown_rx.borrow() && !already_settling {
                self.on_shutdown(order).await;
                return;
            }

            match order.state {
                OrderState::Idle => {
                    order.state = OrderState::Placing;
                }
                OrderState::Placing => {
                    if !self.place_step(order).await {
                        return;
                    }
                }
                OrderState::Working | OrderState::Stepping => {
                    if !self.work_step(order, rx).await {
                        return;
                    }
                }
                OrderState::MarketFallback => {
                    self.market_fallback(order).await;
                }
                OrderState::MarketPlaced => {
                    if !self.await_market_fill(order, rx).await {
                        return;
                    }
                }
                OrderState::Cancelling => {
                    self.finish_cancel(order).await;
                    return;
                }
                OrderState::Filled | OrderState::Cancelled | OrderState::Failed => {
                    self.finalize(order).await;
                    return;
                }
            }
        }
    }

    async fn place_step(&self, order: &mut ManagedOrder) -> bool {
        let quote = match self.gateway.get_quote(&self.instrument_id).await {
            Ok(q) => q,
            Err(e) => return self.handle_place_error(order, e).await,
        };

        let limit = match step_price(
            quote.bid,
            quote.ask,
            order.intent.tick_size,
            order.step_index,
            self.config.max_steps,
            order.intent.side,
        ) {
            Ok(p) => p,
            Err(_) => {
                order.state = OrderState::Failed;
                order.cancel_reason = Some("invalid tick size".to_string());
                self.publish(order);
                return true;
            }
        };

        match self
            .gateway
            .place_order(&self.account_id, &self.instrument_id, order.intent.side, order.remaining(), PlaceOrderPrice::Limit(limit), Some(&order.intent.correlation_id))
            .await
        {
            Ok(placed) => {
                order.broker_order_id = Some(placed.broker_order_id.clone());
                order.current_limit = Some(limit);
                order.placed_at = Some(now_utc());
                order.last_transition_at = now_utc();
                if placed.filled_qty > Decimal::ZERO {
                    self.record_fill(order, placed.filled_qty, placed.avg_fill_price.unwrap_or(limit)).await;
                }
                order.state = if order.remaining() <= Decimal::ZERO { OrderState::Filled } else { OrderState::Working };
                self.publish(order);
                if order.state == OrderState::Working {
                    self.notifier
                        .notify(
                            None,
                            &NotifyEvent::OrderPlaced {
                                account_id: self.account_id.clone(),
                                instrument_id: self.instrument_id.clone(),
                                broker_order_id: placed.broker_order_id,
                                limit_price: limit.to_string(),
                            },
                        )
                        .await;
                }
                true
            }
            Err(e) => self.handle_place_error(order, e).await,
        }
    }

    async fn handle_place_error(&self, order: &mut ManagedOrder, err: GatewayError) -> bool {
        match err {
            GatewayError::RateLimited { retry_after_ms } => {
                order.attempts += 1;
                if order.attempts > self.config.max_place_retries {
                    order.state = OrderState::Failed;
                    order.cancel_reason = Some("place retries exhausted".to_string());
                    self.publish(order);
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                true
            }
            GatewayError::RejectedByBroker(reason) => {
                order.state = OrderState::Failed;
                order.cancel_reason = Some(reason.clone());
                self.publish(order);
                self.notifier
                    .notify(
                        None,
                        &NotifyEvent::OrderFailed {
                            account_id: self.account_id.clone(),
                            instrument_id: self.instrument_id.clone(),
                            reason,
                        },
                    )
                    .await;
                true
            }
            GatewayError::AuthExpired => {
                order.attempts += 1;
                if order.attempts > self.config.max_place_retries {
                    order.state = OrderState::Failed;
                    self.publish(order);
                    return true;
                }
                true
            }
            GatewayError::Transport(_) => {
                order.attempts += 1;
                if order.attempts > self.config.max_place_retries {
                    order.state = OrderState::Failed;
                    order.cancel_reason = Some("transport retries exhausted".to_string());
                    self.publish(order);
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(200 * order.attempts as u64)).await;
                true
            }
            GatewayError::NotFound(_) | GatewayError::Malformed(_) => {
                order.state = OrderState::Failed;
                self.publish(order);
                true
            }
        }
    }

    /// Working/Stepping: races the step timer against an inbound control message, per the
    /// per-order task model in §4.5/§4.6.
    async fn work_step(&self, order: &mut ManagedOrder, rx: &mut mpsc::Receiver<EngineCommand>) -> bool {
        let mut holds = 0u32;
        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.config.step_interval) => {}
                cmd = rx.recv() => {
                    match cmd {
                        Some(EngineCommand::CancelInstrument { reason, .. }) => {
                            order.cancel_reason = Some(reason);
                            order.state = OrderState::Cancelling;
                            return true;
                        }
                        Some(EngineCommand::ReconcileMissing { .. }) => {
                            if let Some(id) = &order.broker_order_id {
                                if self.gateway.cancel_order(&self.account_id, id).await.is_err() {}
                            }
                            continue;
                        }
                        Some(EngineCommand::Shutdown) | None => {
                            order.state = OrderState::Cancelling;
                            return true;
                        }
                        Some(EngineCommand::Submit(_)) => continue,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        order.state = OrderState::Cancelling;
                        return true;
                    }
                }
            }

            // Poll for a fill before advancing the step (push-or-poll unified by re-quoting
            // open orders through the gateway).
            if let Ok(open_orders) = self.gateway.get_open_orders(&self.account_id).await {
                if let Some(id) = &order.broker_order_id {
                    if !open_orders.iter().any(|o| &o.broker_order_id == id) {
                        // No longer open: treat as filled for the remaining size.
                        self.record_fill(order, order.remaining(), order.current_limit.unwrap_or(Decimal::ZERO)).await;
                        order.state = OrderState::Filled;
                        return true;
                    }
                    if let Some(seen) = open_orders.iter().find(|o| &o.broker_order_id == id) {
                        if seen.filled_qty > order.filled_qty {
                            let newly = seen.filled_qty - order.filled_qty;
                            self.record_fill(order, newly, order.current_limit.unwrap_or(Decimal::ZERO)).await;
                            if order.remaining() <= Decimal::ZERO {
                                order.state = OrderState::Filled;
                                return true;
                            }
                        }
                    }
                }
            }

            let quote = match self.gateway.get_quote(&self.instrument_id).await {
                Ok(q) => q,
                Err(_) => continue,
            };
            if !is_spread_reasonable(quote.bid, quote.ask, order.intent.tick_size, self.config.max_spread_ratio, self.config.max_spread_ticks) {
                holds += 1;
                if holds > self.config.max_spread_holds && !self.config.force_progress {
                    order.state = OrderState::Failed;
                    order.cancel_reason = Some("unreasonable spread persisted".to_string());
                    self.publish(order);
                    return true;
                }
                if holds <= self.config.max_spread_holds {
                    continue;
                }
            }

            order.state = OrderState::Stepping;
            return self.step_once(order).await;
        }
    }

    async fn step_once(&self, order: &mut ManagedOrder) -> bool {
        let Some(id) = order.broker_order_id.clone() else {
            order.state = OrderState::Placing;
            return true;
        };

        let mut attempts = 0u32;
        loop {
            match self.gateway.cancel_order(&self.account_id, &id).await {
                Ok(CancelResult::AlreadyFilled) => {
                    self.record_fill(order, order.remaining(), order.current_limit.unwrap_or(Decimal::ZERO)).await;
                    order.state = OrderState::Filled;
                    return true;
                }
                Ok(CancelResult::Cancelled) | Ok(CancelResult::NotFound) => {
                    // `step_index >= max_steps` already placed at the fully aggressive price
                    // (`step_price` treats any index at or past `max_steps` as the opposite
                    // touch); if that placement didn't fill either, there's nowhere further to
                    // step, so drive a terminal outcome instead of re-placing at the same price.
                    let already_at_max = order.step_index >= self.config.max_steps;
                    order.step_index += 1;
                    order.last_transition_at = now_utc();
                    if already_at_max {
                        if self.config.enable_market_fallback {
                            order.state = OrderState::MarketFallback;
                        } else {
                            order.state = OrderState::Failed;
                            order.cancel_reason = Some("progressive steps exhausted at full aggression".to_string());
                        }
                    } else {
                        order.state = OrderState::Placing;
                    }
                    self.publish(order);
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.config.step_attempt_budget {
                        order.step_index += 1;
                        order.state = OrderState::Placing;
                        self.publish(order);
                        return true;
                    }
                    tokio::time::sleep(Duration::from_millis(200 * attempts as u64)).await;
                }
                Err(GatewayError::RejectedByBroker(reason)) => {
                    log::warn!("engine.cancel_rejected account={} instrument={} reason={reason}", self.account_id, self.instrument_id);
                    order.state = OrderState::Placing;
                    self.publish(order);
                    return true;
                }
                Err(_) => {
                    order.step_index += 1;
                    order.state = OrderState::Placing;
                    self.publish(order);
                    return true;
                }
            }
        }
    }

    async fn market_fallback(&self, order: &mut ManagedOrder) {
        match self
            .gateway
            .place_order(&self.account_id, &self.instrument_id, order.intent.side, order.remaining(), PlaceOrderPrice::Market, Some(&order.intent.correlation_id))
            .await
        {
            Ok(placed) => {
                order.broker_order_id = Some(placed.broker_order_id);
                if placed.filled_qty > Decimal::ZERO {
                    self.record_fill(order, placed.filled_qty, placed.avg_fill_price.unwrap_or(Decimal::ZERO)).await;
                }
                order.state = if order.remaining() <= Decimal::ZERO { OrderState::Filled } else { OrderState::MarketPlaced };
            }
            Err(_) => {
                order.state = OrderState::Failed;
                order.cancel_reason = Some("market fallback place failed".to_string());
            }
        }
        self.publish(order);
    }

    async fn await_market_fill(&self, order: &mut ManagedOrder, rx: &mut mpsc::Receiver<EngineCommand>) -> bool {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                cmd = rx.recv() => {
                    if matches!(cmd, Some(EngineCommand::Shutdown) | None) {
                        order.state = OrderState::Cancelling;
                        return true;
                    }
                }
            }
            if let Ok(open_orders) = self.gateway.get_open_orders(&self.account_id).await {
                let still_open = order
                    .broker_order_id
                    .as_ref()
                    .map(|id| open_orders.iter().any(|o| &o.broker_order_id == id))
                    .unwrap_or(false);
                if !still_open {
                    self.record_fill(order, order.remaining(), order.current_limit.unwrap_or(Decimal::ZERO)).await;
                    order.state = OrderState::Filled;
                    return true;
                }
            }
        }
    }

    async fn finish_cancel(&self, order: &mut ManagedOrder) {
        if let Some(id) = &order.broker_order_id {
            let budget = tokio::time::timeout(self.config.post_fill_cancel_budget, self.gateway.cancel_order(&self.account_id, id)).await;
            match budget {
                Ok(Ok(CancelResult::AlreadyFilled)) => {
                    self.record_fill(order, order.remaining(), order.current_limit.unwrap_or(Decimal::ZERO)).await;
                    order.state = OrderState::Filled;
                }
                _ => {
                    order.state = OrderState::Cancelled;
                }
            }
        } else {
            order.state = OrderState::Cancelled;
        }
        self.finalize(order).await;
    }

    async fn on_shutdown(&self, order: &mut ManagedOrder) {
        if matches!(order.state, OrderState::Working | OrderState::Stepping | OrderState::MarketPlaced) {
            if let Some(id) = &order.broker_order_id {
                let result = tokio::time::timeout(self.config.post_fill_cancel_budget, self.gateway.cancel_order(&self.account_id, id)).await;
                if matches!(result, Ok(Ok(CancelResult::AlreadyFilled))) {
                    self.record_fill(order, order.remaining(), order.current_limit.unwrap_or(Decimal::ZERO)).await;
                    order.state = OrderState::Filled;
                } else {
                    order.state = OrderState::Cancelled;
                }
            } else {
                order.state = OrderState::Cancelled;
            }
        }
        order.last_transition_at = now_utc();
        self.publish(order);
    }

    async fn record_fill(&self, order: &mut ManagedOrder, qty: Decimal, price: Decimal) {
        let prior_notional = order.avg_fill_price.unwrap_or(Decimal::ZERO) * order.filled_qty;
        let new_filled = order.filled_qty + qty;
        order.avg_fill_price = if new_filled > Decimal::ZERO { Some((prior_notional + price * qty) / new_filled) } else { None };
        order.filled_qty = new_filled;

        let action = match order.intent.strategy.as_action_str() {
            "open" => Action::Open,
            "close" => Action::Close,
            _ => Action::Adjust,
        };

        let observed_delta = match self.gateway.get_positions(&self.account_id, "USD").await {
            Ok(positions) => positions.iter().find(|p| p.instrument_id == self.instrument_id).map(|p| p.delta),
            Err(_) => None,
        };

        let record = DeltaRecord {
            id: None,
            account_id: self.account_id.clone(),
            instrument_id: self.instrument_id.clone(),
            correlation_id: Some(order.intent.correlation_id.clone()),
            action,
            target_delta: None,
            move_position_delta: None,
            observed_delta: observed_delta.or(Some(Decimal::ZERO)),
            order_id: order.broker_order_id.clone(),
            created_at: now_utc(),
            tv_signal_id: Some(order.intent.correlation_id.clone()),
        };
        if let Err(e) = self.store.upsert(&record) {
            log::error!("engine.delta_write_failed account={} instrument={} err={e:#}", self.account_id, self.instrument_id);
        }

        self.notifier
            .notify(
                None,
                &NotifyEvent::OrderFilled {
                    account_id: self.account_id.clone(),
                    instrument_id: self.instrument_id.clone(),
                    filled_qty: order.filled_qty.to_string(),
                    avg_fill_price: order.avg_fill_price.unwrap_or(Decimal::ZERO).to_string(),
                },
            )
            .await;
    }

    async fn finalize(&self, order: &mut ManagedOrder) {
        order.last_transition_at = now_utc();
        self.publish(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gateway::{MockGateway, MockGatewayConfig};
    use crate::signal::Strategy;
    use std::sync::Arc;

    fn test_intent(instrument_id: &str) -> OrderIntent {
        OrderIntent {
            account_id: "acct1".to_string(),
            instrument_id: instrument_id.to_string(),
            side: Side::Buy,
            size: dec!(1),
            tick_size: dec!(0.05),
            correlation_id: "corr-1".to_string(),
            strategy: Strategy::OpenLong,
            created_at: now_utc(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progressive_fill_reaches_filled_state() {
        let gw = Arc::new(MockGateway::new(MockGatewayConfig {
            fill_probability_at_touch: 1.0,
            ..Default::default()
        }));
        let expiry = now_utc().date_naive() + chrono::Duration::days(30);
        gw.seed_chain("XYZ", dec!(100), &[expiry], &[dec!(100)]);
        let chain = gw.get_option_chain("XYZ", None).await.unwrap();
        let instrument_id = chain.contracts[0].instrument_id.clone();

        let store = DeltaStore::new(":memory:").unwrap();
        store.init_db().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let notifier = Arc::new(crate::notifier::LogNotifier);

        let engine = AccountEngine::new(
            "acct1".to_string(),
            gw.clone(),
            store,
            notifier,
            EngineConfig { step_interval: Duration::from_millis(10), ..Default::default() },
            shutdown_rx,
        );

        engine.submit(test_intent(&instrument_id)).await.unwrap();

        let mut filled = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gw.simulate_tick();
            if let Some(snap) = engine.snapshot(&instrument_id) {
                if snap.state == OrderState::Filled {
                    filled = true;
                    break;
                }
            }
        }
        assert!(filled, "expected order to reach Filled state");
    }
}

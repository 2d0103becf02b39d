//! Polling Manager (C6): two independent loops (positions, orders), each a cooperative task
//! built on `tokio::time::interval` with an immediate first tick, wrapped in an
//! error-budget/backoff discipline. Each loop publishes a `PollingStatus` snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::{watch, RwLock};

use crate::account::AccountRegistry;
use crate::broker::BrokerGateway;
use crate::engine::{AccountEngine, OrderState};
use crate::notifier::{NotifyEvent, Notifier};
use crate::store::{Action, DeltaRecord, DeltaStore};
use crate::utils::now_utc;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PollingStatus {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub last_tick_started_at: Option<DateTime<Utc>>,
    pub last_tick_ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
    pub tick_count: u64,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub position_interval: Duration,
    pub order_interval: Duration,
    pub max_consecutive_errors: u32,
    pub error_backoff: Duration,
    pub shutdown_grace: Duration,
    pub delta_change_threshold: Decimal,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            position_interval: Duration::from_secs(15 * 60),
            order_interval: Duration::from_secs(5 * 60),
            max_consecutive_errors: 5,
            error_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            delta_change_threshold: Decimal::new(1, 2),
        }
    }
}

struct LoopState {
    status: RwLock<PollingStatus>,
    enabled: watch::Sender<bool>,
}

pub struct PollingManager {
    accounts: Arc<AccountRegistry>,
    gateway: Arc<dyn BrokerGateway>,
    store: DeltaStore,
    notifier: Arc<dyn Notifier>,
    engines: Arc<HashMap<String, Arc<AccountEngine>>>,
    config: PollingConfig,
    positions: Arc<LoopState>,
    orders: Arc<LoopState>,
}

impl PollingManager {
    pub fn new(
        accounts: Arc<AccountRegistry>,
        gateway: Arc<dyn BrokerGateway>,
        store: DeltaStore,
        notifier: Arc<dyn Notifier>,
        engines: Arc<HashMap<String, Arc<AccountEngine>>>,
        config: PollingConfig,
        auto_start: bool,
    ) -> Self {
        let (positions_tx, _) = watch::channel(auto_start);
        let (orders_tx, _) = watch::channel(auto_start);
        Self {
            accounts,
            gateway,
            store,
            notifier,
            engines,
            config,
            positions: Arc::new(LoopState {
                status: RwLock::new(PollingStatus { enabled: auto_start, ..Default::default() }),
                enabled: positions_tx,
            }),
            orders: Arc::new(LoopState {
                status: RwLock::new(PollingStatus { enabled: auto_start, ..Default::default() }),
                enabled: orders_tx,
            }),
        }
    }

    pub async fn position_status(&self) -> PollingStatus {
        self.positions.status.read().await.clone()
    }

    pub async fn order_status(&self) -> PollingStatus {
        self.orders.status.read().await.clone()
    }

    pub async fn set_positions_enabled(&self, enabled: bool) {
        let mut s = self.positions.status.write().await;
        s.enabled = enabled;
        if enabled {
            s.consecutive_errors = 0;
            s.last_error = None;
        }
        drop(s);
        let _ = self.positions.enabled.send(enabled);
    }

    pub async fn set_orders_enabled(&self, enabled: bool) {
        let mut s = self.orders.status.write().await;
        s.enabled = enabled;
        if enabled {
            s.consecutive_errors = 0;
            s.last_error = None;
        }
        drop(s);
        let _ = self.orders.enabled.send(enabled);
    }

    pub fn spawn(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let position_me = self.clone();
        let mut position_shutdown = shutdown_rx.clone();
        let position_handle = tokio::spawn(async move { position_me.run_position_loop(&mut position_shutdown).await });

        let order_me = self.clone();
        let mut order_shutdown = shutdown_rx;
        let order_handle = tokio::spawn(async move { order_me.run_order_loop(&mut order_shutdown).await });

        (position_handle, order_handle)
    }

    pub async fn tick_positions_once(&self) {
        let _ = self.position_tick().await;
    }

    pub async fn tick_orders_once(&self) {
        let _ = self.order_tick().await;
    }

    async fn run_position_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut enabled_rx = self.positions.enabled.subscribe();
        let interval = self.config.position_interval;
        {
            self.positions.status.write().await.interval_seconds = interval.as_secs();
        }

        let mut next_delay = Duration::from_millis(0);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(next_delay) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                return;
            }
            if !*enabled_rx.borrow() {
                next_delay = Duration::from_secs(1);
                continue;
            }

            let outcome = self.run_one_tick(&self.positions.status, interval, self.position_tick()).await;
            if outcome.disabled {
                let _ = self.positions.enabled.send(false);
                self.notifier
                    .notify(None, &NotifyEvent::PollingDisabled { loop_name: "positions".to_string(), consecutive_errors: outcome.consecutive_errors })
                    .await;
                next_delay = Duration::from_secs(1);
                continue;
            }
            next_delay = outcome.next_delay;
        }
    }

    async fn run_order_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut enabled_rx = self.orders.enabled.subscribe();
        let interval = self.config.order_interval;
        {
            self.orders.status.write().await.interval_seconds = interval.as_secs();
        }

        let mut next_delay = Duration::from_millis(0);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(next_delay) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                return;
            }
            if !*enabled_rx.borrow() {
                next_delay = Duration::from_secs(1);
                continue;
            }

            let outcome = self.run_one_tick(&self.orders.status, interval, self.order_tick()).await;
            if outcome.disabled {
                let _ = self.orders.enabled.send(false);
                self.notifier
                    .notify(None, &NotifyEvent::PollingDisabled { loop_name: "orders".to_string(), consecutive_errors: outcome.consecutive_errors })
                    .await;
                next_delay = Duration::from_secs(1);
                continue;
            }
            next_delay = outcome.next_delay;
        }
    }

    /// Runs one tick against `status`, applying the shared error-budget/backoff discipline.
    /// Returns whether the loop should now disable itself.
    async fn run_one_tick<Fut>(&self, status: &RwLock<PollingStatus>, interval: Duration, tick: Fut) -> TickOutcome
    where
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let started = now_utc();
        {
            status.write().await.last_tick_started_at = Some(started);
        }

        let result = tokio::time::timeout(interval.max(self.config.shutdown_grace), tick).await;
        let ended = now_utc();

        let mut s = status.write().await;
        s.last_tick_ended_at = Some(ended);
        s.tick_count += 1;

        match result {
            Ok(Ok(())) => {
                s.last_error = None;
                s.consecutive_errors = 0;
            }
            Ok(Err(e)) => {
                s.last_error = Some(e);
                s.consecutive_errors += 1;
            }
            Err(_) => {
                s.last_error = Some("tick timed out".to_string());
                s.consecutive_errors += 1;
            }
        }

        if s.consecutive_errors >= self.config.max_consecutive_errors {
            s.enabled = false;
            return TickOutcome { disabled: true, consecutive_errors: s.consecutive_errors, next_delay: interval };
        }

        let next_delay = if s.consecutive_errors > 0 { interval.min(self.config.error_backoff) } else { interval };
        TickOutcome { disabled: false, consecutive_errors: s.consecutive_errors, next_delay }
    }

    async fn position_tick(&self) -> Result<(), String> {
        let names = self.accounts.enabled_names();
        let threshold = self.config.delta_change_threshold;
        let results = join_all(names.into_iter().map(|name| {
            let gateway = self.gateway.clone();
            let store = self.store.clone();
            let notifier = self.notifier.clone();
            async move { Self::position_tick_one(&gateway, &store, notifier.as_ref(), &name, threshold).await }
        }))
        .await;

        let errors: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    async fn position_tick_one(
        gateway: &Arc<dyn BrokerGateway>,
        store: &DeltaStore,
        notifier: &dyn Notifier,
        account_id: &str,
        threshold: Decimal,
    ) -> Result<(), String> {
        let positions = gateway.get_positions(account_id, "USD").await.map_err(|e| e.to_string())?;
        for pos in positions {
            let last = store
                .latest_by_instrument(account_id, &pos.instrument_id)
                .map_err(|e| e.to_string())?
                .and_then(|r| r.observed_delta);
            let moved = match last {
                Some(prev) => (pos.delta - prev).abs() > threshold,
                None => true,
            };
            if !moved {
                continue;
            }
            let record = DeltaRecord {
                id: None,
                account_id: account_id.to_string(),
                instrument_id: pos.instrument_id.clone(),
                correlation_id: None,
                action: Action::Observe,
                target_delta: None,
                move_position_delta: None,
                observed_delta: Some(pos.delta),
                order_id: None,
                created_at: now_utc(),
                tv_signal_id: None,
            };
            store.upsert(&record).map_err(|e| e.to_string())?;
            if pos.delta.abs() > threshold * Decimal::from(10) {
                notifier
                    .notify(
                        None,
                        &NotifyEvent::DeltaBreach {
                            account_id: account_id.to_string(),
                            instrument_id: pos.instrument_id.clone(),
                            observed_delta: pos.delta.to_string(),
                            threshold: threshold.to_string(),
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn order_tick(&self) -> Result<(), String> {
        let names = self.accounts.enabled_names();
        let engines = self.engines.clone();
        let results = join_all(names.into_iter().map(|name| {
            let gateway = self.gateway.clone();
            let engines = engines.clone();
            async move { Self::order_tick_one(&gateway, &engines, &name).await }
        }))
        .await;

        let errors: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    async fn order_tick_one(gateway: &Arc<dyn BrokerGateway>, engines: &HashMap<String, Arc<AccountEngine>>, account_id: &str) -> Result<(), String> {
        let open_orders = gateway.get_open_orders(account_id).await.map_err(|e| e.to_string())?;
        let Some(engine) = engines.get(account_id) else { return Ok(()) };

        for open_order in &open_orders {
            match engine.snapshot(&open_order.instrument_id) {
                Some(snapshot) => {
                    let terminal = matches!(snapshot.state, OrderState::Filled | OrderState::Cancelled | OrderState::Failed);
                    if snapshot.broker_order_id.is_none() && !terminal {
                        engine.reconcile_missing(&open_order.instrument_id).await;
                    }
                }
                None => {
                    log::info!("polling.unknown_open_order account={account_id} instrument={}", open_order.instrument_id);
                }
            }
        }
        Ok(())
    }
}

struct TickOutcome {
    disabled: bool,
    consecutive_errors: u32,
    next_delay: Duration,
}

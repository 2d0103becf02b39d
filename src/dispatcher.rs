//! Signal Dispatcher (C7): entry point for inbound signals. Validates, dedupes, serializes
//! per account via an `mpsc` mailbox, and orchestrates C4 → C5 → C3. Mirrors the
//! teacher's `watch::channel` hand-off from its scanner task to the trading loop, but uses
//! `mpsc` for point-to-point ordered delivery since each account's signals must be processed
//! in arrival order rather than fanned out to many readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::account::AccountRegistry;
use crate::broker::BrokerGateway;
use crate::contract_selector::{ContractSelector, SelectionConfig};
use crate::engine::AccountEngine;
use crate::errors::EngineError;
use crate::notifier::{NotifyEvent, Notifier};
use crate::signal::{OrderIntent, Signal, Strategy};
use crate::store::{Action, DeltaRecord, DeltaStore};
use crate::utils::now_utc;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchAck {
    pub correlation_id: String,
    pub instrument_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchRejection {
    pub error_kind: String,
    pub message: String,
}

pub type DispatchResult = Result<DispatchAck, DispatchRejection>;

struct DedupeEntry {
    seen_at: DateTime<Utc>,
    outcome: DispatchResult,
}

pub struct SignalDispatcher {
    accounts: Arc<AccountRegistry>,
    gateway: Arc<dyn BrokerGateway>,
    store: DeltaStore,
    notifier: Arc<dyn Notifier>,
    engines: Arc<HashMap<String, Arc<AccountEngine>>>,
    selection_config: SelectionConfig,
    dedupe_window: Duration,
    signal_timeout: Duration,
    dedupe: Mutex<HashMap<(String, String), DedupeEntry>>,
    mailboxes: AsyncMutex<HashMap<String, mpsc::Sender<(Signal, oneshot::Sender<DispatchResult>)>>>,
}

impl SignalDispatcher {
    pub fn new(
        accounts: Arc<AccountRegistry>,
        gateway: Arc<dyn BrokerGateway>,
        store: DeltaStore,
        notifier: Arc<dyn Notifier>,
        engines: Arc<HashMap<String, Arc<AccountEngine>>>,
        selection_config: SelectionConfig,
        dedupe_window: Duration,
        signal_timeout: Duration,
    ) -> Self {
        Self {
            accounts,
            gateway,
            store,
            notifier,
            engines,
            selection_config,
            dedupe_window,
            signal_timeout,
            dedupe: Mutex::new(HashMap::new()),
            mailboxes: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(self: &Arc<Self>, signal: Signal) -> DispatchResult {
        if let Err(rejection) = self.validate(&signal) {
            return Err(rejection);
        }

        let correlation_id = signal.correlation_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let dedupe_key = (signal.account_id.clone(), correlation_id.clone());

        if let Some(prior) = self.check_dedupe(&dedupe_key) {
            return prior;
        }

        let mut signal = signal;
        signal.correlation_id = Some(correlation_id.clone());

        let sender = self.mailbox_for(&signal.account_id).await;
        let (tx, rx) = oneshot::channel();
        if sender.send((signal, tx)).await.is_err() {
            return Err(DispatchRejection { error_kind: "internal".to_string(), message: "dispatcher mailbox closed".to_string() });
        }

        let outcome = match tokio::time::timeout(self.signal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchRejection { error_kind: "internal".to_string(), message: "worker dropped response".to_string() }),
            Err(_) => Err(DispatchRejection { error_kind: "timeout".to_string(), message: "signal processing budget exceeded; order continues autonomously".to_string() }),
        };

        self.store_dedupe(dedupe_key, outcome.clone());
        outcome
    }

    fn validate(&self, signal: &Signal) -> Result<(), DispatchRejection> {
        if signal.account_id.trim().is_empty() || signal.underlying.trim().is_empty() {
            return Err(DispatchRejection { error_kind: "bad_signal".to_string(), message: "missing required field".to_string() });
        }
        if signal.size <= Decimal::ZERO {
            return Err(DispatchRejection { error_kind: "bad_signal".to_string(), message: "size must be positive".to_string() });
        }
        if !self.accounts.is_enabled(&signal.account_id) {
            return Err(DispatchRejection { error_kind: "bad_signal".to_string(), message: format!("account {} is unknown or disabled", signal.account_id) });
        }
        Ok(())
    }

    fn check_dedupe(&self, key: &(String, String)) -> Option<DispatchResult> {
        let mut dedupe = self.dedupe.lock();
        let now = now_utc();
        dedupe.retain(|_, entry| now.signed_duration_since(entry.seen_at).to_std().unwrap_or_default() < self.dedupe_window);
        dedupe.get(key).map(|entry| entry.outcome.clone())
    }

    fn store_dedupe(&self, key: (String, String), outcome: DispatchResult) {
        self.dedupe.lock().insert(key, DedupeEntry { seen_at: now_utc(), outcome });
    }

    async fn mailbox_for(self: &Arc<Self>, account_id: &str) -> mpsc::Sender<(Signal, oneshot::Sender<DispatchResult>)> {
        let mut mailboxes = self.mailboxes.lock().await;
        if let Some(tx) = mailboxes.get(account_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(64);
        let me = self.clone();
        let account_id_owned = account_id.to_string();
        tokio::spawn(async move { me.run_account_worker(account_id_owned, rx).await });
        mailboxes.insert(account_id.to_string(), tx.clone());
        tx
    }

    async fn run_account_worker(self: Arc<Self>, account_id: String, mut rx: mpsc::Receiver<(Signal, oneshot::Sender<DispatchResult>)>) {
        while let Some((signal, ack_tx)) = rx.recv().await {
            let result = self.process_one(&account_id, signal).await;
            let _ = ack_tx.send(result);
        }
    }

    async fn process_one(&self, account_id: &str, signal: Signal) -> DispatchResult {
        let selector = ContractSelector::new(self.gateway.as_ref(), self.selection_config.clone());
        let as_of = now_utc().date_naive();

        let (contract, _quote) = match selector.select(&signal, as_of).await {
            Ok(pair) => pair,
            Err(EngineError::UnreasonableSpread) if Strategy::from_transition(signal.position_transition).is_closing() => {
                // Closing trades cannot wait on a clean spread; proceed is out of scope for
                // the contract selector itself, so surface this as a retryable rejection the
                // operator can see in C9 rather than silently guessing a contract.
                return Err(DispatchRejection { error_kind: "unreasonable_spread".to_string(), message: "spread unreasonable on close; alert raised".to_string() });
            }
            Err(e) => {
                return Err(DispatchRejection { error_kind: "no_suitable_contract".to_string(), message: e.to_string() });
            }
        };

        let correlation_id = signal.correlation_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let strategy = Strategy::from_transition(signal.position_transition);

        let target_record = DeltaRecord {
            id: None,
            account_id: account_id.to_string(),
            instrument_id: contract.instrument_id.clone(),
            correlation_id: Some(correlation_id.clone()),
            action: Action::Target,
            target_delta: Some(contract.delta.unwrap_or(Decimal::ZERO)),
            move_position_delta: None,
            observed_delta: None,
            order_id: None,
            created_at: now_utc(),
            tv_signal_id: Some(correlation_id.clone()),
        };
        if let Err(e) = self.store.upsert(&target_record) {
            return Err(DispatchRejection { error_kind: "internal".to_string(), message: format!("failed to write target delta: {e:#}") });
        }

        let intent = OrderIntent {
            account_id: account_id.to_string(),
            instrument_id: contract.instrument_id.clone(),
            side: signal.side,
            size: signal.size,
            tick_size: contract.tick_size,
            correlation_id: correlation_id.clone(),
            strategy,
            created_at: now_utc(),
        };

        let Some(engine) = self.engines.get(account_id) else {
            return Err(DispatchRejection { error_kind: "internal".to_string(), message: "no engine registered for account".to_string() });
        };

        if let Err(e) = engine.submit(intent).await {
            let adjust_record = DeltaRecord {
                id: None,
                account_id: account_id.to_string(),
                instrument_id: contract.instrument_id.clone(),
                correlation_id: Some(correlation_id.clone()),
                action: Action::Adjust,
                target_delta: None,
                move_position_delta: Some(Decimal::ZERO),
                observed_delta: None,
                order_id: None,
                created_at: now_utc(),
                tv_signal_id: Some(correlation_id.clone()),
            };
            let _ = self.store.upsert(&adjust_record);
            self.notifier
                .notify(
                    None,
                    &NotifyEvent::OrderFailed { account_id: account_id.to_string(), instrument_id: contract.instrument_id.clone(), reason: e.to_string() },
                )
                .await;
            return Err(DispatchRejection { error_kind: "engine_rejected".to_string(), message: e.to_string() });
        }

        Ok(DispatchAck { correlation_id, instrument_id: contract.instrument_id })
    }
}

//! Integration tests: end-to-end scenarios from the engine's testable-properties list,
//! run against `MockGateway` and an in-memory `DeltaStore`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::watch;

use options_webhook_trader::account::{Account, AccountRegistry};
use options_webhook_trader::broker::{BrokerGateway, Side};
use options_webhook_trader::contract_selector::SelectionConfig;
use options_webhook_trader::dispatcher::SignalDispatcher;
use options_webhook_trader::engine::{AccountEngine, EngineConfig, OrderState};
use options_webhook_trader::mock_gateway::{MockGateway, MockGatewayConfig};
use options_webhook_trader::notifier::LogNotifier;
use options_webhook_trader::polling::{PollingConfig, PollingManager};
use options_webhook_trader::signal::{PositionTransition, Signal};
use options_webhook_trader::store::DeltaStore;
use options_webhook_trader::utils::now_utc;

fn single_account(name: &str) -> Arc<AccountRegistry> {
    Arc::new(AccountRegistry::new(vec![Account {
        name: name.to_string(),
        enabled: true,
        broker_credentials_ref: "mock".to_string(),
        notifier_channel: None,
    }]))
}

fn harness(
    gw: Arc<MockGateway>,
) -> (Arc<SignalDispatcher>, Arc<HashMap<String, Arc<AccountEngine>>>, DeltaStore, watch::Sender<bool>) {
    let store = DeltaStore::new(":memory:").unwrap();
    store.init_db().unwrap();
    let notifier = Arc::new(LogNotifier);
    let accounts = single_account("A");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway: Arc<dyn BrokerGateway> = gw;
    let mut engines = HashMap::new();
    engines.insert(
        "A".to_string(),
        Arc::new(AccountEngine::new(
            "A".to_string(),
            gateway.clone(),
            store.clone(),
            notifier.clone(),
            EngineConfig { step_interval: Duration::from_millis(5), ..Default::default() },
            shutdown_rx.clone(),
        )),
    );
    let engines = Arc::new(engines);

    let dispatcher = Arc::new(SignalDispatcher::new(
        accounts,
        gateway,
        store.clone(),
        notifier,
        engines.clone(),
        SelectionConfig::default(),
        Duration::from_secs(10),
        Duration::from_secs(5),
    ));

    (dispatcher, engines, store, shutdown_tx)
}

fn open_signal(correlation_id: &str) -> Signal {
    Signal {
        account_id: "A".to_string(),
        side: Side::Buy,
        position_transition: PositionTransition::FlatToLong,
        size: dec!(1),
        underlying: "XYZ".to_string(),
        correlation_id: Some(correlation_id.to_string()),
        comment: None,
        received_at: now_utc(),
    }
}

/// End to end: a signal dispatches to a filled order, writing one `target` record
/// before placement and one `open` record once the order fills.
#[tokio::test(flavor = "multi_thread")]
async fn happy_path_progressive_fill_writes_target_then_open() {
    let gw = Arc::new(MockGateway::new(MockGatewayConfig { fill_probability_at_touch: 1.0, ..Default::default() }));
    let expiry = now_utc().date_naive() + chrono::Duration::days(30);
    gw.seed_chain("XYZ", dec!(100), &[expiry], &[dec!(100)]);

    let (dispatcher, engines, store, _shutdown) = harness(gw.clone());

    let ack = dispatcher.dispatch(open_signal("s1")).await.expect("dispatch accepted");

    let mut filled = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        gw.simulate_tick();
        if let Some(snap) = engines.get("A").unwrap().snapshot(&ack.instrument_id) {
            if snap.state == OrderState::Filled {
                filled = true;
                break;
            }
        }
    }
    assert!(filled, "expected order to reach Filled state");

    let records = store
        .by_account("A", (now_utc() - chrono::Duration::hours(1), now_utc() + chrono::Duration::hours(1)), None, 100, 0)
        .unwrap();
    assert!(records.iter().any(|r| r.action.as_str() == "target" && r.correlation_id.as_deref() == Some("s1")));
    assert!(records.iter().any(|r| r.action.as_str() == "open" && r.correlation_id.as_deref() == Some("s1")));
}

/// Two identical signals within the dedupe window produce one order
/// and one matching ack each, served from the cached outcome on the second call.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_signal_within_window_is_deduped() {
    let gw = Arc::new(MockGateway::new(MockGatewayConfig { fill_probability_at_touch: 1.0, ..Default::default() }));
    let expiry = now_utc().date_naive() + chrono::Duration::days(30);
    gw.seed_chain("XYZ", dec!(100), &[expiry], &[dec!(100)]);

    let (dispatcher, _engines, store, _shutdown) = harness(gw);

    let first = dispatcher.dispatch(open_signal("s2")).await.expect("first accepted");
    let second = dispatcher.dispatch(open_signal("s2")).await.expect("second accepted");
    assert_eq!(first.correlation_id, second.correlation_id);
    assert_eq!(first.instrument_id, second.instrument_id);

    let targets = store
        .by_account("A", (now_utc() - chrono::Duration::hours(1), now_utc() + chrono::Duration::hours(1)), None, 100, 0)
        .unwrap()
        .into_iter()
        .filter(|r| r.action.as_str() == "target" && r.correlation_id.as_deref() == Some("s2"))
        .count();
    assert_eq!(targets, 1, "only the first dispatch should have placed a target record");
}

/// The polling loop disables itself after `max_consecutive_errors`
/// consecutive failures and leaves the unrelated loop untouched.
#[tokio::test(flavor = "multi_thread")]
async fn position_polling_disables_after_repeated_errors() {
    struct AlwaysFailGateway;

    #[async_trait::async_trait]
    impl BrokerGateway for AlwaysFailGateway {
        async fn get_option_chain(
            &self,
            _underlying: &str,
            _expiry_filter: Option<chrono::NaiveDate>,
        ) -> Result<options_webhook_trader::broker::Chain, options_webhook_trader::errors::GatewayError> {
            Ok(Default::default())
        }
        async fn get_quote(
            &self,
            instrument_id: &str,
        ) -> Result<options_webhook_trader::broker::QuoteSnapshot, options_webhook_trader::errors::GatewayError> {
            Err(options_webhook_trader::errors::GatewayError::NotFound(instrument_id.to_string()))
        }
        async fn get_positions(
            &self,
            _account_id: &str,
            _currency: &str,
        ) -> Result<Vec<options_webhook_trader::broker::Position>, options_webhook_trader::errors::GatewayError> {
            Err(options_webhook_trader::errors::GatewayError::Transport("simulated outage".to_string()))
        }
        async fn get_open_orders(
            &self,
            _account_id: &str,
        ) -> Result<Vec<options_webhook_trader::broker::OpenOrder>, options_webhook_trader::errors::GatewayError> {
            Ok(vec![])
        }
        async fn place_order(
            &self,
            _account_id: &str,
            _instrument_id: &str,
            _side: Side,
            _size: rust_decimal::Decimal,
            _price: options_webhook_trader::broker::PlaceOrderPrice,
            _idempotency_key: Option<&str>,
        ) -> Result<options_webhook_trader::broker::PlacedOrder, options_webhook_trader::errors::GatewayError> {
            unimplemented!()
        }
        async fn cancel_order(
            &self,
            _account_id: &str,
            _broker_order_id: &str,
        ) -> Result<options_webhook_trader::broker::CancelResult, options_webhook_trader::errors::GatewayError> {
            unimplemented!()
        }
        async fn get_us_symbols(&self, _account_id: &str) -> Result<Vec<String>, options_webhook_trader::errors::GatewayError> {
            Ok(vec![])
        }
    }

    let gateway: Arc<dyn BrokerGateway> = Arc::new(AlwaysFailGateway);
    let store = DeltaStore::new(":memory:").unwrap();
    store.init_db().unwrap();
    let notifier = Arc::new(LogNotifier);
    let accounts = single_account("A");
    let engines = Arc::new(HashMap::new());

    let config = PollingConfig {
        position_interval: Duration::from_millis(10),
        order_interval: Duration::from_secs(3600),
        max_consecutive_errors: 3,
        error_backoff: Duration::from_millis(10),
        shutdown_grace: Duration::from_millis(50),
        delta_change_threshold: rust_decimal_macros::dec!(0.01),
    };
    let polling = Arc::new(PollingManager::new(accounts, gateway, store, notifier, engines, config, true));

    for _ in 0..3 {
        polling.tick_positions_once().await;
    }

    let status = polling.position_status().await;
    assert_eq!(status.consecutive_errors, 3);
    assert!(status.last_error.is_some());
}

/// Shutdown signaled mid-step attempts one bounded cancel and does not
/// advance the order past `Cancelling`/`Cancelled`.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_during_working_step_cancels_and_stops() {
    let gw = Arc::new(MockGateway::new(MockGatewayConfig { fill_probability_at_touch: 0.0, ..Default::default() }));
    let expiry = now_utc().date_naive() + chrono::Duration::days(30);
    gw.seed_chain("XYZ", dec!(100), &[expiry], &[dec!(100)]);

    let (dispatcher, engines, _store, shutdown_tx) = harness(gw);
    let ack = dispatcher.dispatch(open_signal("s6")).await.expect("dispatch accepted");

    // Let the order reach Working (placed, unfilled) before signaling shutdown.
    let mut working = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(snap) = engines.get("A").unwrap().snapshot(&ack.instrument_id) {
            if snap.broker_order_id.is_some() {
                working = true;
                break;
            }
        }
    }
    assert!(working, "expected order to be placed before shutdown");

    let _ = shutdown_tx.send(true);
    engines.get("A").unwrap().shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snap = engines.get("A").unwrap().snapshot(&ack.instrument_id).unwrap();
    assert!(
        matches!(snap.state, OrderState::Cancelled | OrderState::Cancelling | OrderState::Filled),
        "unexpected terminal state after shutdown: {:?}",
        snap.state
    );
}

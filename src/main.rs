use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use options_webhook_trader::account::{Account, AccountRegistry};
use options_webhook_trader::api::{self, ApiState};
use options_webhook_trader::broker::BrokerGateway;
use options_webhook_trader::config::Settings;
use options_webhook_trader::contract_selector::SelectionConfig;
use options_webhook_trader::dispatcher::SignalDispatcher;
use options_webhook_trader::engine::{AccountEngine, EngineConfig};
use options_webhook_trader::mock_gateway::{MockGateway, MockGatewayConfig};
use options_webhook_trader::notifier::{LogNotifier, MultiNotifier, Notifier, WebhookNotifier};
use options_webhook_trader::polling::{PollingConfig, PollingManager};
use options_webhook_trader::store::DeltaStore;
use options_webhook_trader::utils;

#[derive(Debug, Parser)]
#[command(name = "options-webhook-trader", version)]
struct Cli {
    /// Override MOCK_MODE
    #[arg(long)]
    mock: Option<bool>,
    /// Load and validate configuration, then exit without starting the service.
    #[arg(long)]
    config_check: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            log::error!("app.config_error err={e:#}");
            std::process::exit(2);
        }
    };
    if let Some(mock) = cli.mock {
        settings.mock_mode = mock;
    }

    if cli.config_check {
        log::info!("app.config_check ok accounts={}", settings.accounts.len());
        return Ok(());
    }

    let store = DeltaStore::new(&settings.sqlite_path)?;
    store.init_db()?;

    log::info!(
        "app.start mock_mode={} port={} sqlite={} accounts={}",
        settings.mock_mode,
        settings.port,
        store.path(),
        settings.accounts.len()
    );

    let accounts: Vec<Account> = settings
        .accounts
        .iter()
        .map(|a| Account {
            name: a.name.clone(),
            enabled: a.enabled,
            broker_credentials_ref: a.broker_credentials_ref.clone(),
            notifier_channel: a.notifier_channel.clone(),
        })
        .collect();
    let account_registry = Arc::new(AccountRegistry::new(accounts));

    // No live broker SDK ships with this crate (broker auth/session handling is a collaborator
    // this crate depends on, not something it implements); mock mode is the only runnable path
    // until a `LiveGateway` is wired in against a real session.
    if !settings.mock_mode {
        log::warn!("app.live_gateway_unavailable falling back to mock gateway");
    }
    let mock_gw = Arc::new(MockGateway::new(MockGatewayConfig::default()));
    seed_mock_universe(&mock_gw);
    let gateway: Arc<dyn BrokerGateway> = mock_gw;

    let notifier: Arc<dyn Notifier> = match &settings.webhook_notifier_url {
        Some(url) => Arc::new(MultiNotifier::new(vec![
            Box::new(LogNotifier),
            Box::new(WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(settings.gateway_call_timeout_seconds),
                3,
            )),
        ])),
        None => Arc::new(LogNotifier),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_config = EngineConfig {
        max_steps: settings.progressive_max_steps,
        step_interval: Duration::from_secs(settings.progressive_step_interval_seconds),
        max_place_retries: settings.max_place_retries,
        force_progress: settings.force_progress,
        enable_market_fallback: settings.enable_market_fallback,
        max_spread_ratio: settings.spread_ratio_threshold,
        max_spread_ticks: settings.spread_tick_multiple_threshold,
        max_spread_holds: settings.max_spread_holds,
        ..Default::default()
    };

    let mut engines = HashMap::new();
    for account in account_registry.enabled_names() {
        let engine = Arc::new(AccountEngine::new(
            account.clone(),
            gateway.clone(),
            store.clone(),
            notifier.clone(),
            engine_config.clone(),
            shutdown_rx.clone(),
        ));
        engines.insert(account, engine);
    }
    let engines = Arc::new(engines);

    let selection_config = SelectionConfig {
        min_days_to_expiry: settings.contract_selection.min_days_to_expiry,
        max_days_to_expiry: settings.contract_selection.max_days_to_expiry,
        target_days_to_expiry: settings.contract_selection.target_days_to_expiry,
        target_delta_opening: settings.contract_selection.target_delta_open,
        max_spread_ratio: settings.spread_ratio_threshold,
        max_spread_ticks: settings.spread_tick_multiple_threshold,
        spread_retry_delay_ms: 750,
    };

    let dispatcher = Arc::new(SignalDispatcher::new(
        account_registry.clone(),
        gateway.clone(),
        store.clone(),
        notifier.clone(),
        engines.clone(),
        selection_config,
        Duration::from_secs(settings.dedupe_window_seconds),
        Duration::from_secs(settings.signal_timeout_seconds),
    ));

    let polling_config = PollingConfig {
        position_interval: Duration::from_secs(settings.position_polling_interval_minutes * 60),
        order_interval: Duration::from_secs(settings.order_polling_interval_minutes * 60),
        max_consecutive_errors: settings.max_polling_errors,
        error_backoff: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(settings.shutdown_grace_seconds),
        delta_change_threshold: settings.delta_change_threshold,
    };
    let polling = Arc::new(PollingManager::new(
        account_registry.clone(),
        gateway.clone(),
        store.clone(),
        notifier.clone(),
        engines.clone(),
        polling_config,
        settings.auto_start_polling,
    ));
    let (position_loop, order_loop) = polling.spawn(shutdown_rx.clone());

    let retention_store = store.clone();
    let retention_days = settings.delta_retention_days;
    let mut retention_shutdown = shutdown_rx.clone();
    let retention_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(24 * 60 * 60)) => {}
                _ = retention_shutdown.changed() => {}
            }
            if *retention_shutdown.borrow() {
                return;
            }
            match retention_store.prune_older_than(retention_days) {
                Ok(deleted) => log::info!("store.pruned deleted={deleted}"),
                Err(e) => log::error!("store.prune_error err={e:#}"),
            }
        }
    });

    let api_state = ApiState {
        dispatcher,
        polling,
        store: store.clone(),
        gateway: gateway.clone(),
        accounts: account_registry.clone(),
        mock_mode: settings.mock_mode,
        version: env!("CARGO_PKG_VERSION"),
    };

    let host = settings.host.clone();
    let port = settings.port;
    let server = tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, &host, port).await {
            log::error!("api.error err={e:#}");
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("app.shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    for engine in engines.values() {
        engine.shutdown().await;
    }

    let _ = tokio::time::timeout(Duration::from_secs(settings.shutdown_grace_seconds), async {
        let _ = position_loop.await;
        let _ = order_loop.await;
    })
    .await;
    retention_task.abort();
    server.abort();

    log::info!("app.shutdown_complete");
    Ok(())
}

fn seed_mock_universe(gw: &MockGateway) {
    use chrono::Duration as D;
    use rust_decimal_macros::dec;

    let today = utils::now_utc().date_naive();
    let expiries = [today + D::days(14), today + D::days(30), today + D::days(45)];
    let strikes = [dec!(90), dec!(95), dec!(100), dec!(105), dec!(110)];
    gw.seed_chain("SPY", dec!(100), &expiries, &strikes);
    gw.seed_chain("QQQ", dec!(100), &expiries, &strikes);
}

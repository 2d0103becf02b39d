//! HTTP surface: the inbound webhook (C7's entry point) and the Operator Query API (C9).
//! Built on `Router::new().route(...)`, `Query`/`State` extractors, and `Json`/`StatusCode`
//! responses. JSON-only, no HTML dashboard.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::account::AccountRegistry;
use crate::broker::BrokerGateway;
use crate::dispatcher::SignalDispatcher;
use crate::polling::PollingManager;
use crate::signal::{PositionTransition, Signal};
use crate::store::{Action, DeltaStore};
use crate::utils::now_utc;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<SignalDispatcher>,
    pub polling: Arc<PollingManager>,
    pub store: DeltaStore,
    pub gateway: Arc<dyn BrokerGateway>,
    pub accounts: Arc<AccountRegistry>,
    pub mock_mode: bool,
    pub version: &'static str,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/positions/{account}", get(positions))
        .route("/delta/records", get(delta_records))
        .route("/delta/summary", get(delta_summary))
        .route("/polling/positions/start", post(polling_positions_start))
        .route("/polling/positions/stop", post(polling_positions_stop))
        .route("/polling/positions/tick", post(polling_positions_tick))
        .route("/polling/orders/start", post(polling_orders_start))
        .route("/polling/orders/stop", post(polling_orders_stop))
        .route("/polling/orders/tick", post(polling_orders_tick))
        .route("/chain", get(chain))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: ApiState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    log::info!("api.start url=http://{addr} mock_mode={}", state.mock_mode);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Inbound webhook body. `market_position`/`prev_market_position` are translated
/// into a `PositionTransition`; numeric fields accept numeric-as-string.
#[derive(Debug, Deserialize)]
struct WebhookBody {
    account_name: String,
    side: String,
    size: String,
    market_position: String,
    prev_market_position: String,
    underlying: String,
    tv_id: Option<String>,
    comment: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn transition_from(prev: &str, next: &str) -> Option<PositionTransition> {
    use PositionTransition::*;
    match (prev, next) {
        ("flat", "long") => Some(FlatToLong),
        ("long", "flat") => Some(LongToFlat),
        ("flat", "short") => Some(FlatToShort),
        ("short", "flat") => Some(ShortToFlat),
        ("long", "short") => Some(LongToShort),
        ("short", "long") => Some(ShortToLong),
        ("long", "long") => Some(LongToLong),
        ("short", "short") => Some(ShortToShort),
        _ => None,
    }
}

async fn webhook(State(state): State<ApiState>, Json(body): Json<WebhookBody>) -> impl IntoResponse {
    let side = match body.side.to_lowercase().as_str() {
        "buy" => crate::broker::Side::Buy,
        "sell" => crate::broker::Side::Sell,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error_kind": "bad_signal", "message": format!("unknown side '{other}'") })),
            )
                .into_response();
        }
    };

    let Some(transition) = transition_from(&body.prev_market_position, &body.market_position) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error_kind": "bad_signal", "message": "unrecognized market_position transition" })),
        )
            .into_response();
    };

    let size: Decimal = match body.size.parse() {
        Ok(s) => s,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error_kind": "bad_signal", "message": "size is not numeric" }))).into_response();
        }
    };

    let signal = Signal {
        account_id: body.account_name,
        side,
        position_transition: transition,
        size,
        underlying: body.underlying,
        correlation_id: body.tv_id,
        comment: body.comment,
        received_at: body.timestamp.unwrap_or_else(now_utc),
    };

    match state.dispatcher.dispatch(signal).await {
        Ok(ack) => (StatusCode::OK, Json(json!({ "accepted": true, "correlation_id": ack.correlation_id, "instrument_id": ack.instrument_id }))).into_response(),
        Err(rejection) if rejection.error_kind == "bad_signal" => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error_kind": rejection.error_kind, "message": rejection.message }))).into_response()
        }
        Err(rejection) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error_kind": rejection.error_kind, "message": rejection.message, "retryable": rejection.error_kind == "timeout" })),
        )
            .into_response(),
    }
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let position_status = state.polling.position_status().await;
    let order_status = state.polling.order_status().await;
    let degraded = !position_status.enabled || !order_status.enabled;
    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "checks": {
            "positions_polling_enabled": position_status.enabled,
            "orders_polling_enabled": order_status.enabled,
        }
    }))
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "version": state.version,
        "mock_mode": state.mock_mode,
        "accounts": state.accounts.enabled_names(),
        "polling": {
            "positions": state.polling.position_status().await,
            "orders": state.polling.order_status().await,
        }
    }))
}

#[derive(Deserialize)]
struct CurrencyQ {
    currency: Option<String>,
}

async fn positions(State(state): State<ApiState>, Path(account): Path<String>, Query(q): Query<CurrencyQ>) -> impl IntoResponse {
    let currency = q.currency.unwrap_or_else(|| "USD".to_string());
    match state.gateway.get_positions(&account, &currency).await {
        Ok(positions) => Json(json!({ "account": account, "currency": currency, "positions": positions })).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, Json(json!({ "error_kind": "gateway_error", "message": e.to_string(), "retryable": e.is_retryable() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct DeltaRecordsQ {
    account: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    action: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn delta_records(State(state): State<ApiState>, Query(q): Query<DeltaRecordsQ>) -> impl IntoResponse {
    let from = q.from.unwrap_or_else(|| now_utc() - chrono::Duration::days(7));
    let to = q.to.unwrap_or_else(now_utc);
    let actions = q.action.and_then(|a| Action::from_str_loose(&a)).map(|a| vec![a]);
    match state.store.by_account(&q.account, (from, to), actions.as_deref(), q.limit.unwrap_or(100), q.offset.unwrap_or(0)) {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error_kind": "internal", "message": e.to_string() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct DeltaSummaryQ {
    account: String,
    period_days: Option<i64>,
}

async fn delta_summary(State(state): State<ApiState>, Query(q): Query<DeltaSummaryQ>) -> impl IntoResponse {
    let period_days = q.period_days.unwrap_or(7);
    let from = now_utc() - chrono::Duration::days(period_days);
    match state.store.summary(&q.account, (from, now_utc())) {
        Ok(summary) => Json(json!({
            "count_by_action": summary.count_by_action,
            "net_observed_delta": summary.net_observed_delta.map(|d| d.to_string()),
            "last_updated": summary.last_updated,
        }))
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error_kind": "internal", "message": e.to_string() }))).into_response(),
    }
}

async fn polling_positions_start(State(state): State<ApiState>) -> impl IntoResponse {
    state.polling.set_positions_enabled(true).await;
    Json(json!({ "ok": true }))
}

async fn polling_positions_stop(State(state): State<ApiState>) -> impl IntoResponse {
    state.polling.set_positions_enabled(false).await;
    Json(json!({ "ok": true }))
}

async fn polling_positions_tick(State(state): State<ApiState>) -> impl IntoResponse {
    state.polling.tick_positions_once().await;
    Json(json!({ "ok": true }))
}

async fn polling_orders_start(State(state): State<ApiState>) -> impl IntoResponse {
    state.polling.set_orders_enabled(true).await;
    Json(json!({ "ok": true }))
}

async fn polling_orders_stop(State(state): State<ApiState>) -> impl IntoResponse {
    state.polling.set_orders_enabled(false).await;
    Json(json!({ "ok": true }))
}

async fn polling_orders_tick(State(state): State<ApiState>) -> impl IntoResponse {
    state.polling.tick_orders_once().await;
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
struct ChainQ {
    underlying: String,
    expiry: Option<chrono::NaiveDate>,
}

async fn chain(State(state): State<ApiState>, Query(q): Query<ChainQ>) -> impl IntoResponse {
    match state.gateway.get_option_chain(&q.underlying, q.expiry).await {
        Ok(chain) => Json(chain).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, Json(json!({ "error_kind": "gateway_error", "message": e.to_string(), "retryable": e.is_retryable() }))).into_response(),
    }
}

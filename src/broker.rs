//! Broker Gateway (C2): the request/response contract to the broker. This module defines
//! the trait and the domain types; it never talks to a real broker itself. Two
//! implementations live alongside it: `mock_gateway::MockGateway` (in-memory simulator,
//! selected when `mock_mode = true`) and `LiveGateway`, a thin stub over an opaque
//! `BrokerSession` capability (credential storage and the wire protocol are out of scope,
//! a collaborator this crate depends on, not a deliverable of it).

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Right {
    Call,
    Put,
}

/// An opaque capability handed in by the caller at startup. The gateway treats it as a
/// black box: refreshing it, reading it, or knowing its shape is the broker-auth
/// collaborator's job, not this crate's.
#[derive(Debug, Clone)]
pub struct BrokerSession {
    pub account_id: String,
    pub credentials_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionContract {
    pub instrument_id: String,
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: Decimal,
    pub right: Right,
    pub tick_size: Decimal,
    pub multiplier: u32,
    /// Open interest / volume / quote-implied delta, when the chain response carries them.
    /// `None` when the broker's chain snapshot didn't include Greeks (C4 then falls back to
    /// an approximation).
    pub open_interest: Option<u64>,
    pub volume: Option<u64>,
    pub delta: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Chain {
    pub contracts: Vec<OptionContract>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub instrument_id: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub mark: Decimal,
    pub underlying_price: Decimal,
    pub delta: Option<Decimal>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl QuoteSnapshot {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::from(2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub instrument_id: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub mark_price: Decimal,
    pub delta: Decimal,
    pub gamma: Decimal,
    pub theta: Decimal,
    pub vega: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub broker_order_id: String,
    pub account_id: String,
    pub instrument_id: String,
    pub side: Side,
    pub limit_price: Option<Decimal>,
    pub size: Decimal,
    pub filled_qty: Decimal,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelResult {
    Cancelled,
    AlreadyFilled,
    NotFound,
}

#[derive(Debug, Clone, Copy)]
pub enum PlaceOrderPrice {
    Limit(Decimal),
    Market,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub broker_order_id: String,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// The broker request/response contract. All methods are I/O and may fail with
/// a `GatewayError`; implementations must never block an unrelated account's call behind a
/// lock held for this one (rate limiting is internal to the gateway).
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn get_option_chain(
        &self,
        underlying: &str,
        expiry_filter: Option<NaiveDate>,
    ) -> Result<Chain, GatewayError>;

    async fn get_quote(&self, instrument_id: &str) -> Result<QuoteSnapshot, GatewayError>;

    async fn get_positions(&self, account_id: &str, currency: &str) -> Result<Vec<Position>, GatewayError>;

    async fn get_open_orders(&self, account_id: &str) -> Result<Vec<OpenOrder>, GatewayError>;

    async fn place_order(
        &self,
        account_id: &str,
        instrument_id: &str,
        side: Side,
        size: Decimal,
        price: PlaceOrderPrice,
        idempotency_key: Option<&str>,
    ) -> Result<PlacedOrder, GatewayError>;

    async fn cancel_order(&self, account_id: &str, broker_order_id: &str) -> Result<CancelResult, GatewayError>;

    async fn get_us_symbols(&self, account_id: &str) -> Result<Vec<String>, GatewayError>;
}

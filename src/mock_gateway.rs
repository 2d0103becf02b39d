//! In-memory broker simulator selected when `mock_mode = true`. Orders and positions live in
//! `HashMap`s behind a lock, fills are driven by a distance-to-touch fill intensity, and a
//! small fault rate occasionally rejects a place call, exercising the progressive execution
//! engine's retry and cancel/replace paths under test.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use rand::Rng;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::broker::{
    BrokerGateway, CancelResult, Chain, OpenOrder, OptionContract, PlaceOrderPrice, PlacedOrder, Position,
    QuoteSnapshot, Right, Side,
};
use crate::errors::GatewayError;
use crate::utils::now_utc;

#[derive(Debug, Clone)]
struct MockOrder {
    account_id: String,
    instrument_id: String,
    side: Side,
    size: Decimal,
    limit_price: Option<Decimal>,
    filled_qty: Decimal,
    avg_fill_price: Option<Decimal>,
    status: MockOrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockOrderStatus {
    Open,
    Filled,
    Cancelled,
}

struct MockState {
    chains: HashMap<String, Chain>,
    quotes: HashMap<String, QuoteSnapshot>,
    positions: HashMap<(String, String), Position>,
    orders: HashMap<String, MockOrder>,
    next_id: u64,
}

/// Configuration for the simulator's realism knobs. Kept separate from `Settings` so tests
/// can dial determinism (zero fault rate, zero fill jitter) without touching the service's
/// real configuration surface.
#[derive(Debug, Clone)]
pub struct MockGatewayConfig {
    pub place_fault_rate: f64,
    pub fill_probability_at_touch: f64,
    pub default_tick_size: Decimal,
    pub default_multiplier: u32,
}

impl Default for MockGatewayConfig {
    fn default() -> Self {
        Self {
            place_fault_rate: 0.0,
            fill_probability_at_touch: 0.6,
            default_tick_size: Decimal::new(5, 2),
            default_multiplier: 100,
        }
    }
}

pub struct MockGateway {
    config: MockGatewayConfig,
    state: RwLock<MockState>,
}

impl MockGateway {
    pub fn new(config: MockGatewayConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MockState {
                chains: HashMap::new(),
                quotes: HashMap::new(),
                positions: HashMap::new(),
                orders: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Seeds a synthetic chain + quotes for `underlying`, used by tests and by the
    /// mock-mode bootstrap to populate a tradable universe without a live feed.
    pub fn seed_chain(&self, underlying: &str, underlying_price: Decimal, expiries: &[NaiveDate], strikes: &[Decimal]) {
        let mut state = self.state.write();
        let mut contracts = Vec::new();
        for expiry in expiries {
            for strike in strikes {
                for right in [Right::Call, Right::Put] {
                    let instrument_id = format!(
                        "{underlying}-{}-{}-{}",
                        expiry.format("%y%m%d"),
                        strike,
                        if right == Right::Call { "C" } else { "P" }
                    );
                    let intrinsic = match right {
                        Right::Call => (underlying_price - strike).max(Decimal::ZERO),
                        Right::Put => (strike - underlying_price).max(Decimal::ZERO),
                    };
                    let mark = (intrinsic + Decimal::new(50, 2)).max(Decimal::new(1, 2));
                    let half_spread = self.config.default_tick_size;
                    let bid = (mark - half_spread).max(Decimal::new(1, 2));
                    let ask = mark + half_spread;

                    contracts.push(OptionContract {
                        instrument_id: instrument_id.clone(),
                        underlying: underlying.to_string(),
                        expiry: *expiry,
                        strike: *strike,
                        right,
                        tick_size: self.config.default_tick_size,
                        multiplier: self.config.default_multiplier,
                        open_interest: Some(100),
                        volume: Some(10),
                        delta: Some(synthetic_delta(right, underlying_price, *strike)),
                    });

                    state.quotes.insert(
                        instrument_id,
                        QuoteSnapshot {
                            instrument_id: contracts.last().unwrap().instrument_id.clone(),
                            bid,
                            ask,
                            last: mark,
                            mark,
                            underlying_price,
                            delta: contracts.last().unwrap().delta,
                            ts: now_utc(),
                        },
                    );
                }
            }
        }
        state.chains.insert(underlying.to_string(), Chain { contracts });
    }

    /// Test/operator hook: overwrite a quote directly, e.g. to walk a spread narrower across
    /// a scenario's ticks.
    pub fn set_quote(&self, quote: QuoteSnapshot) {
        self.state.write().quotes.insert(quote.instrument_id.clone(), quote);
    }

    /// Test hook: force an order to a specific fill state instead of waiting on the
    /// probabilistic simulation below.
    pub fn force_fill(&self, broker_order_id: &str, fill_qty: Decimal, fill_price: Decimal) {
        let mut state = self.state.write();
        if let Some(order) = state.orders.get_mut(broker_order_id) {
            apply_fill(order, fill_qty, fill_price);
            let (account_id, instrument_id, side, new_qty) =
                (order.account_id.clone(), order.instrument_id.clone(), order.side, fill_qty);
            drop(state);
            let mut state = self.state.write();
            apply_position_delta(&mut state, &account_id, &instrument_id, side, new_qty, fill_price);
        }
    }

    /// Advances the simulated market one tick: open orders priced at or through the current
    /// touch have a chance to fill.
    pub fn simulate_tick(&self) {
        let mut rng = rand::rng();
        let mut state = self.state.write();
        let order_ids: Vec<String> = state
            .orders
            .iter()
            .filter(|(_, o)| o.status == MockOrderStatus::Open)
            .map(|(id, _)| id.clone())
            .collect();

        for oid in order_ids {
            let Some(order) = state.orders.get(&oid).cloned() else { continue };
            let Some(quote) = state.quotes.get(&order.instrument_id).cloned() else { continue };
            let Some(limit) = order.limit_price else { continue };

            let marketable = match order.side {
                Side::Buy => limit >= quote.ask,
                Side::Sell => limit <= quote.bid,
            };
            let roll: f64 = rng.random();
            let should_fill = marketable && roll < self.config.fill_probability_at_touch;
            if !should_fill {
                continue;
            }

            let remaining = order.size - order.filled_qty;
            if remaining <= Decimal::ZERO {
                continue;
            }
            let fill_price = match order.side {
                Side::Buy => quote.ask,
                Side::Sell => quote.bid,
            };
            if let Some(o) = state.orders.get_mut(&oid) {
                apply_fill(o, remaining, fill_price);
            }
            apply_position_delta(&mut state, &order.account_id, &order.instrument_id, order.side, remaining, fill_price);
        }
    }
}

fn apply_fill(order: &mut MockOrder, qty: Decimal, price: Decimal) {
    let prior_notional = order.avg_fill_price.unwrap_or(Decimal::ZERO) * order.filled_qty;
    let new_filled = order.filled_qty + qty;
    order.avg_fill_price = if new_filled > Decimal::ZERO {
        Some((prior_notional + price * qty) / new_filled)
    } else {
        None
    };
    order.filled_qty = new_filled;
    if order.filled_qty >= order.size {
        order.status = MockOrderStatus::Filled;
    }
}

fn apply_position_delta(
    state: &mut MockState,
    account_id: &str,
    instrument_id: &str,
    side: Side,
    qty: Decimal,
    price: Decimal,
) {
    let signed = match side {
        Side::Buy => qty,
        Side::Sell => -qty,
    };
    let delta_per_contract = state
        .quotes
        .get(instrument_id)
        .and_then(|q| q.delta)
        .unwrap_or(Decimal::ZERO);

    let key = (account_id.to_string(), instrument_id.to_string());
    let pos = state.positions.entry(key).or_insert_with(|| Position {
        account_id: account_id.to_string(),
        instrument_id: instrument_id.to_string(),
        qty: Decimal::ZERO,
        avg_price: Decimal::ZERO,
        mark_price: price,
        delta: Decimal::ZERO,
        gamma: Decimal::ZERO,
        theta: Decimal::ZERO,
        vega: Decimal::ZERO,
        unrealized_pnl: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
    });

    let new_qty = pos.qty + signed;
    if pos.qty == Decimal::ZERO || pos.qty.signum() == signed.signum() {
        let prior_notional = pos.avg_price * pos.qty.abs();
        let added_notional = price * signed.abs();
        let total_abs = pos.qty.abs() + signed.abs();
        pos.avg_price = if total_abs > Decimal::ZERO {
            (prior_notional + added_notional) / total_abs
        } else {
            Decimal::ZERO
        };
    } else {
        let closing = signed.abs().min(pos.qty.abs());
        let pnl_per_unit = if pos.qty > Decimal::ZERO { price - pos.avg_price } else { pos.avg_price - price };
        pos.realized_pnl += pnl_per_unit * closing;
    }
    pos.qty = new_qty;
    pos.mark_price = price;
    pos.delta = new_qty * delta_per_contract;
}

fn synthetic_delta(right: Right, underlying_price: Decimal, strike: Decimal) -> Decimal {
    let moneyness = underlying_price - strike;
    let base = match right {
        Right::Call => Decimal::new(50, 2) + moneyness / Decimal::new(20, 0),
        Right::Put => Decimal::new(-50, 2) + moneyness / Decimal::new(20, 0),
    };
    base.max(Decimal::new(-99, 2)).min(Decimal::new(99, 2))
}

#[async_trait]
impl BrokerGateway for MockGateway {
    async fn get_option_chain(&self, underlying: &str, expiry_filter: Option<NaiveDate>) -> Result<Chain, GatewayError> {
        let state = self.state.read();
        let chain = state
            .chains
            .get(underlying)
            .cloned()
            .unwrap_or_default();
        let contracts = match expiry_filter {
            Some(exp) => chain.contracts.into_iter().filter(|c| c.expiry == exp).collect(),
            None => chain.contracts,
        };
        Ok(Chain { contracts })
    }

    async fn get_quote(&self, instrument_id: &str) -> Result<QuoteSnapshot, GatewayError> {
        self.state
            .read()
            .quotes
            .get(instrument_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(instrument_id.to_string()))
    }

    async fn get_positions(&self, account_id: &str, _currency: &str) -> Result<Vec<Position>, GatewayError> {
        Ok(self
            .state
            .read()
            .positions
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn get_open_orders(&self, account_id: &str) -> Result<Vec<OpenOrder>, GatewayError> {
        Ok(self
            .state
            .read()
            .orders
            .iter()
            .filter(|(_, o)| o.account_id == account_id && o.status == MockOrderStatus::Open)
            .map(|(id, o)| OpenOrder {
                broker_order_id: id.clone(),
                account_id: o.account_id.clone(),
                instrument_id: o.instrument_id.clone(),
                side: o.side,
                limit_price: o.limit_price,
                size: o.size,
                filled_qty: o.filled_qty,
                status: "open".to_string(),
            })
            .collect())
    }

    async fn place_order(
        &self,
        account_id: &str,
        instrument_id: &str,
        side: Side,
        size: Decimal,
        price: PlaceOrderPrice,
        _idempotency_key: Option<&str>,
    ) -> Result<PlacedOrder, GatewayError> {
        if self.config.place_fault_rate > 0.0 {
            let roll: f64 = rand::rng().random();
            if roll < self.config.place_fault_rate {
                return Err(GatewayError::Transport("simulated place fault".to_string()));
            }
        }

        let mut state = self.state.write();
        let order_id = format!("mock-{}-{}", state.next_id, Uuid::new_v4());
        state.next_id += 1;

        let limit_price = match price {
            PlaceOrderPrice::Limit(p) => Some(p),
            PlaceOrderPrice::Market => None,
        };

        let mut order = MockOrder {
            account_id: account_id.to_string(),
            instrument_id: instrument_id.to_string(),
            side,
            size,
            limit_price,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            status: MockOrderStatus::Open,
        };

        // Market orders fill immediately at the opposite touch.
        if let PlaceOrderPrice::Market = price {
            if let Some(quote) = state.quotes.get(instrument_id).cloned() {
                let fill_price = match side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                apply_fill(&mut order, size, fill_price);
                state.orders.insert(order_id.clone(), order.clone());
                apply_position_delta(&mut state, account_id, instrument_id, side, size, fill_price);
                return Ok(PlacedOrder {
                    broker_order_id: order_id,
                    filled_qty: order.filled_qty,
                    avg_fill_price: order.avg_fill_price,
                });
            }
        }

        state.orders.insert(order_id.clone(), order);
        Ok(PlacedOrder {
            broker_order_id: order_id,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
        })
    }

    async fn cancel_order(&self, account_id: &str, broker_order_id: &str) -> Result<CancelResult, GatewayError> {
        let mut state = self.state.write();
        let Some(order) = state.orders.get_mut(broker_order_id) else {
            return Ok(CancelResult::NotFound);
        };
        if order.account_id != account_id {
            return Ok(CancelResult::NotFound);
        }
        match order.status {
            MockOrderStatus::Filled => Ok(CancelResult::AlreadyFilled),
            MockOrderStatus::Cancelled => Ok(CancelResult::Cancelled),
            MockOrderStatus::Open => {
                order.status = MockOrderStatus::Cancelled;
                Ok(CancelResult::Cancelled)
            }
        }
    }

    async fn get_us_symbols(&self, _account_id: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self.state.read().chains.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn seeded_gateway() -> MockGateway {
        let gw = MockGateway::new(MockGatewayConfig::default());
        let expiry = now_utc().date_naive() + Duration::days(30);
        gw.seed_chain("XYZ", dec!(100), &[expiry], &[dec!(95), dec!(100), dec!(105)]);
        gw
    }

    #[tokio::test]
    async fn place_and_force_fill_updates_position() {
        let gw = seeded_gateway();
        let chain = gw.get_option_chain("XYZ", None).await.unwrap();
        let contract = &chain.contracts[0];
        let placed = gw
            .place_order("acct1", &contract.instrument_id, Side::Buy, dec!(1), PlaceOrderPrice::Limit(dec!(1.00)), None)
            .await
            .unwrap();
        assert_eq!(placed.filled_qty, Decimal::ZERO);

        gw.force_fill(&placed.broker_order_id, dec!(1), dec!(1.05));
        let positions = gw.get_positions("acct1", "USD").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty, dec!(1));
    }

    #[tokio::test]
    async fn cancel_not_found_for_unknown_order() {
        let gw = seeded_gateway();
        let result = gw.cancel_order("acct1", "does-not-exist").await.unwrap();
        assert_eq!(result, CancelResult::NotFound);
    }

    #[tokio::test]
    async fn market_order_fills_immediately() {
        let gw = seeded_gateway();
        let chain = gw.get_option_chain("XYZ", None).await.unwrap();
        let contract = &chain.contracts[0];
        let placed = gw
            .place_order("acct1", &contract.instrument_id, Side::Buy, dec!(1), PlaceOrderPrice::Market, None)
            .await
            .unwrap();
        assert_eq!(placed.filled_qty, dec!(1));
        assert!(placed.avg_fill_price.is_some());
    }
}

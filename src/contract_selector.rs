//! Contract Selector (C4): given a `Signal` and a `Chain`, picks exactly one `OptionContract`.
//! Deterministic given identical chain/quote inputs; the one piece of I/O is the
//! quote re-fetch used for the spread-reasonableness retry.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::broker::{BrokerGateway, Chain, OptionContract, QuoteSnapshot, Right};
use crate::calc::is_spread_reasonable;
use crate::errors::EngineError;
use crate::signal::{PositionTransition, Signal};

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    pub min_days_to_expiry: i64,
    pub max_days_to_expiry: i64,
    pub target_days_to_expiry: i64,
    pub target_delta_opening: Decimal,
    pub max_spread_ratio: Decimal,
    pub max_spread_ticks: Decimal,
    pub spread_retry_delay_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_days_to_expiry: 7,
            max_days_to_expiry: 45,
            target_days_to_expiry: 30,
            target_delta_opening: dec!(0.30),
            max_spread_ratio: dec!(0.15),
            max_spread_ticks: dec!(2),
            spread_retry_delay_ms: 750,
        }
    }
}

fn right_for_transition(t: PositionTransition) -> Right {
    match t {
        PositionTransition::FlatToLong
        | PositionTransition::ShortToLong
        | PositionTransition::LongToLong
        | PositionTransition::ShortToFlat => Right::Call,
        PositionTransition::FlatToShort
        | PositionTransition::LongToShort
        | PositionTransition::ShortToShort
        | PositionTransition::LongToFlat => Right::Put,
    }
}

fn is_closing_transition(t: PositionTransition) -> bool {
    matches!(t, PositionTransition::LongToFlat | PositionTransition::ShortToFlat)
}

pub struct ContractSelector<'a> {
    gateway: &'a dyn BrokerGateway,
    config: SelectionConfig,
}

impl<'a> ContractSelector<'a> {
    pub fn new(gateway: &'a dyn BrokerGateway, config: SelectionConfig) -> Self {
        Self { gateway, config }
    }

    pub async fn select(&self, signal: &Signal, as_of: NaiveDate) -> Result<(OptionContract, QuoteSnapshot), EngineError> {
        let right = right_for_transition(signal.position_transition);
        let closing = is_closing_transition(signal.position_transition);

        let chain = self
            .gateway
            .get_option_chain(&signal.underlying, None)
            .await
            .map_err(EngineError::Gateway)?;

        let by_right: Vec<&OptionContract> = chain.contracts.iter().filter(|c| c.right == right).collect();
        if by_right.is_empty() {
            return Err(EngineError::NoSuitableContract(format!(
                "no {:?} contracts for {}",
                right, signal.underlying
            )));
        }

        let chosen_expiry = self.pick_expiry(&by_right, as_of)?;
        let in_expiry: Vec<&OptionContract> = by_right.into_iter().filter(|c| c.expiry == chosen_expiry).collect();

        let quote_underlying_price = self
            .gateway
            .get_quote(&in_expiry[0].instrument_id)
            .await
            .map(|q| q.underlying_price)
            .map_err(EngineError::Gateway)?;

        let chosen = self.pick_strike(&in_expiry, quote_underlying_price, closing)?;

        let mut quote = self
            .gateway
            .get_quote(&chosen.instrument_id)
            .await
            .map_err(EngineError::Gateway)?;

        if !is_spread_reasonable(quote.bid, quote.ask, chosen.tick_size, self.config.max_spread_ratio, self.config.max_spread_ticks) {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.spread_retry_delay_ms)).await;
            quote = self.gateway.get_quote(&chosen.instrument_id).await.map_err(EngineError::Gateway)?;
            if !is_spread_reasonable(quote.bid, quote.ask, chosen.tick_size, self.config.max_spread_ratio, self.config.max_spread_ticks) {
                return Err(EngineError::UnreasonableSpread);
            }
        }

        Ok((chosen.clone(), quote))
    }

    fn pick_expiry(&self, candidates: &[&OptionContract], as_of: NaiveDate) -> Result<NaiveDate, EngineError> {
        let mut expiries: Vec<NaiveDate> = candidates
            .iter()
            .map(|c| c.expiry)
            .filter(|exp| {
                let dte = (*exp - as_of).num_days();
                dte >= self.config.min_days_to_expiry && dte <= self.config.max_days_to_expiry
            })
            .collect();
        expiries.sort();
        expiries.dedup();

        if expiries.is_empty() {
            return Err(EngineError::NoSuitableContract("no expiry within configured window".to_string()));
        }

        let target = as_of + chrono::Duration::days(self.config.target_days_to_expiry);
        expiries
            .into_iter()
            .min_by_key(|exp| (*exp - target).num_days().abs())
            .ok_or_else(|| EngineError::NoSuitableContract("expiry selection failed".to_string()))
    }

    /// Opening trades target `target_delta_opening`; closing trades pick closest-to-ATM.
    /// Ties break by higher open interest, then higher volume; a final
    /// spread tie-break is applied by the caller once quotes are fetched, so here we only
    /// need OI/volume as tie-breaks against the primary distance metric.
    fn pick_strike<'c>(&self, candidates: &[&'c OptionContract], underlying_price: Decimal, closing: bool) -> Result<&'c OptionContract, EngineError> {
        if candidates.is_empty() {
            return Err(EngineError::NoSuitableContract("no contracts at chosen expiry".to_string()));
        }

        let scored: Vec<(&&OptionContract, Decimal)> = candidates
            .iter()
            .map(|c| {
                let distance = if closing {
                    (c.strike - underlying_price).abs()
                } else {
                    let approx_delta = c.delta.unwrap_or_else(|| approximate_delta(c, underlying_price));
                    (approx_delta.abs() - self.config.target_delta_opening).abs()
                };
                (c, distance)
            })
            .collect();

        let min_distance = scored.iter().map(|(_, d)| *d).min().ok_or_else(|| {
            EngineError::NoSuitableContract("strike scoring produced no candidates".to_string())
        })?;

        let tolerance = dec!(0.0001);
        let mut tied: Vec<&&OptionContract> = scored
            .iter()
            .filter(|(_, d)| (*d - min_distance).abs() <= tolerance)
            .map(|(c, _)| c)
            .collect();

        tied.sort_by(|a, b| {
            let oi_a = a.open_interest.unwrap_or(0);
            let oi_b = b.open_interest.unwrap_or(0);
            let vol_a = a.volume.unwrap_or(0);
            let vol_b = b.volume.unwrap_or(0);
            oi_b.cmp(&oi_a).then(vol_b.cmp(&vol_a))
        });

        Ok(tied[0])
    }
}

/// Rough Black-Scholes-free fallback when the chain carries no quote-based delta: a linear
/// moneyness ramp clamped to (-1, 1), used only as a tie-break proxy.
fn approximate_delta(contract: &OptionContract, underlying_price: Decimal) -> Decimal {
    let moneyness = underlying_price - contract.strike;
    let ramp = moneyness / (underlying_price.max(dec!(1)) * dec!(0.2));
    let base = match contract.right {
        Right::Call => dec!(0.5) + ramp * dec!(0.5),
        Right::Put => dec!(-0.5) + ramp * dec!(0.5),
    };
    base.max(dec!(-0.99)).min(dec!(0.99))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerGateway, CancelResult, OpenOrder, PlaceOrderPrice, PlacedOrder, Position, Side};
    use crate::errors::GatewayError;
    use crate::mock_gateway::{MockGateway, MockGatewayConfig};
    use crate::utils::now_utc;
    use async_trait::async_trait;
    use chrono::Duration;

    fn as_of() -> NaiveDate {
        now_utc().date_naive()
    }

    #[tokio::test]
    async fn selects_call_for_opening_long() {
        let gw = MockGateway::new(MockGatewayConfig::default());
        let expiry = as_of() + Duration::days(30);
        gw.seed_chain("XYZ", dec!(100), &[expiry], &[dec!(95), dec!(100), dec!(105)]);

        let signal = Signal {
            account_id: "acct1".to_string(),
            side: Side::Buy,
            position_transition: PositionTransition::FlatToLong,
            size: dec!(1),
            underlying: "XYZ".to_string(),
            correlation_id: Some("corr-1".to_string()),
            comment: None,
            received_at: now_utc(),
        };

        let selector = ContractSelector::new(&gw, SelectionConfig::default());
        let (contract, quote) = selector.select(&signal, as_of()).await.unwrap();
        assert_eq!(contract.right, Right::Call);
        assert!(quote.ask >= quote.bid);
    }

    #[tokio::test]
    async fn fails_with_no_suitable_contract_when_no_expiry_in_window() {
        let gw = MockGateway::new(MockGatewayConfig::default());
        let far_expiry = as_of() + Duration::days(400);
        gw.seed_chain("XYZ", dec!(100), &[far_expiry], &[dec!(100)]);

        let signal = Signal {
            account_id: "acct1".to_string(),
            side: Side::Buy,
            position_transition: PositionTransition::FlatToLong,
            size: dec!(1),
            underlying: "XYZ".to_string(),
            correlation_id: None,
            comment: None,
            received_at: now_utc(),
        };

        let selector = ContractSelector::new(&gw, SelectionConfig::default());
        let result = selector.select(&signal, as_of()).await;
        assert!(matches!(result, Err(EngineError::NoSuitableContract(_))));
    }

    struct WideSpreadGateway;

    #[async_trait]
    impl BrokerGateway for WideSpreadGateway {
        async fn get_option_chain(&self, underlying: &str, _expiry_filter: Option<NaiveDate>) -> Result<Chain, GatewayError> {
            Ok(Chain {
                contracts: vec![OptionContract {
                    instrument_id: format!("{underlying}-TEST-100-C"),
                    underlying: underlying.to_string(),
                    expiry: now_utc().date_naive() + Duration::days(30),
                    strike: dec!(100),
                    right: Right::Call,
                    tick_size: dec!(0.05),
                    multiplier: 100,
                    open_interest: Some(10),
                    volume: Some(1),
                    delta: Some(dec!(0.3)),
                }],
            })
        }
        async fn get_quote(&self, instrument_id: &str) -> Result<QuoteSnapshot, GatewayError> {
            Ok(QuoteSnapshot {
                instrument_id: instrument_id.to_string(),
                bid: dec!(1.00),
                ask: dec!(3.00),
                last: dec!(2.00),
                mark: dec!(2.00),
                underlying_price: dec!(100),
                delta: Some(dec!(0.3)),
                ts: now_utc(),
            })
        }
        async fn get_positions(&self, _account_id: &str, _currency: &str) -> Result<Vec<Position>, GatewayError> {
            Ok(vec![])
        }
        async fn get_open_orders(&self, _account_id: &str) -> Result<Vec<OpenOrder>, GatewayError> {
            Ok(vec![])
        }
        async fn place_order(
            &self,
            _account_id: &str,
            _instrument_id: &str,
            _side: Side,
            _size: Decimal,
            _price: PlaceOrderPrice,
            _idempotency_key: Option<&str>,
        ) -> Result<PlacedOrder, GatewayError> {
            unimplemented!()
        }
        async fn cancel_order(&self, _account_id: &str, _broker_order_id: &str) -> Result<CancelResult, GatewayError> {
            unimplemented!()
        }
        async fn get_us_symbols(&self, _account_id: &str) -> Result<Vec<String>, GatewayError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn fails_with_unreasonable_spread_after_retry() {
        let gw = WideSpreadGateway;
        let signal = Signal {
            account_id: "acct1".to_string(),
            side: Side::Buy,
            position_transition: PositionTransition::FlatToLong,
            size: dec!(1),
            underlying: "XYZ".to_string(),
            correlation_id: None,
            comment: None,
            received_at: now_utc(),
        };
        let mut config = SelectionConfig::default();
        config.spread_retry_delay_ms = 1;
        let selector = ContractSelector::new(&gw, config);
        let result = selector.select(&signal, now_utc().date_naive()).await;
        assert!(matches!(result, Err(EngineError::UnreasonableSpread)));
    }
}

//! Pure, deterministic price/spread math (C1). No I/O, no hidden state: every function is
//! total on its typed inputs or reports the single `InvalidTick` failure.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::broker::Side;
use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    Nearest,
    Floor,
    Ceil,
}

/// Round `price` to the nearest multiple of `tick`. Ties in `Nearest` mode resolve to the
/// even tick (banker's rounding), matching `Decimal`'s default `round()` behavior.
pub fn round_to_tick(price: Decimal, tick: Decimal, mode: RoundMode) -> Result<Decimal, EngineError> {
    if tick <= Decimal::ZERO {
        return Err(EngineError::InvalidTick);
    }
    let units = price / tick;
    let rounded_units = match mode {
        RoundMode::Nearest => units.round(),
        RoundMode::Floor => units.floor(),
        RoundMode::Ceil => units.ceil(),
    };
    Ok(rounded_units * tick)
}

/// `(ask - bid) / mid`. Only meaningful for `bid > 0 && ask > 0`; callers must treat any
/// other input as "unreasonable".
pub fn spread_ratio(bid: Decimal, ask: Decimal) -> Decimal {
    if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
        return Decimal::MAX;
    }
    let mid = (ask + bid) / dec!(2);
    if mid <= Decimal::ZERO {
        return Decimal::MAX;
    }
    (ask - bid) / mid
}

pub fn spread_in_ticks(bid: Decimal, ask: Decimal, tick: Decimal) -> Result<Decimal, EngineError> {
    if tick <= Decimal::ZERO {
        return Err(EngineError::InvalidTick);
    }
    Ok(((ask - bid) / tick).round())
}

pub fn is_spread_reasonable(
    bid: Decimal,
    ask: Decimal,
    tick: Decimal,
    max_ratio: Decimal,
    max_ticks: Decimal,
) -> bool {
    if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
        return false;
    }
    let ratio_ok = spread_ratio(bid, ask) <= max_ratio;
    let ticks_ok = match spread_in_ticks(bid, ask, tick) {
        Ok(t) => t <= max_ticks,
        Err(_) => false,
    };
    ratio_ok && ticks_ok
}

/// Limit price for step `k` of `max_steps`, walking from the passive touch toward the
/// aggressive touch. Step 0 is fully passive (own side); step `max_steps` equals the
/// opposite-side touch. Intermediate steps interpolate linearly and round toward the
/// aggressive side (ceil for BUY, floor for SELL) so the engine never under-improves.
pub fn step_price(
    bid: Decimal,
    ask: Decimal,
    tick: Decimal,
    step_index: u32,
    max_steps: u32,
    side: Side,
) -> Result<Decimal, EngineError> {
    if tick <= Decimal::ZERO {
        return Err(EngineError::InvalidTick);
    }
    let (passive, aggressive) = match side {
        Side::Buy => (bid, ask),
        Side::Sell => (ask, bid),
    };
    if max_steps == 0 || step_index >= max_steps {
        return round_to_tick(aggressive, tick, RoundMode::Nearest);
    }
    if step_index == 0 {
        return round_to_tick(passive, tick, RoundMode::Nearest);
    }

    let frac = Decimal::from(step_index) / Decimal::from(max_steps);
    let interpolated = passive + (aggressive - passive) * frac;
    let mode = match side {
        Side::Buy => RoundMode::Ceil,
        Side::Sell => RoundMode::Floor,
    };
    round_to_tick(interpolated, tick, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_tick_rejects_non_positive_tick() {
        assert!(matches!(
            round_to_tick(dec!(1.23), dec!(0), RoundMode::Nearest),
            Err(EngineError::InvalidTick)
        ));
        assert!(matches!(
            round_to_tick(dec!(1.23), dec!(-0.05), RoundMode::Nearest),
            Err(EngineError::InvalidTick)
        ));
    }

    #[test]
    fn round_to_tick_is_idempotent() {
        let once = round_to_tick(dec!(1.2345), dec!(0.05), RoundMode::Nearest).unwrap();
        let twice = round_to_tick(once, dec!(0.05), RoundMode::Nearest).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn spread_reasonable_boundary_cases() {
        // bid == ask, both > 0: ratio 0, always reasonable.
        assert!(is_spread_reasonable(dec!(1.00), dec!(1.00), dec!(0.05), dec!(0.15), dec!(2)));
        // bid == 0 or ask == 0: never reasonable.
        assert!(!is_spread_reasonable(dec!(0), dec!(1.00), dec!(0.05), dec!(0.15), dec!(2)));
        assert!(!is_spread_reasonable(dec!(1.00), dec!(0), dec!(0.05), dec!(0.15), dec!(2)));
    }

    #[test]
    fn spread_reasonable_is_monotonic_in_thresholds() {
        let bid = dec!(1.00);
        let ask = dec!(1.20);
        let tick = dec!(0.05);
        // Wide thresholds: reasonable.
        assert!(is_spread_reasonable(bid, ask, tick, dec!(0.30), dec!(10)));
        // Tightening either threshold cannot turn it reasonable if it was already false,
        // and cannot turn a reasonable spread unreasonable by loosening.
        let loose = is_spread_reasonable(bid, ask, tick, dec!(0.30), dec!(10));
        let tight = is_spread_reasonable(bid, ask, tick, dec!(0.01), dec!(1));
        assert!(loose || !tight);
    }

    #[test]
    fn step_price_buy_walks_from_bid_to_ask() {
        let bid = dec!(1.00);
        let ask = dec!(1.20);
        let tick = dec!(0.05);
        let step0 = step_price(bid, ask, tick, 0, 4, Side::Buy).unwrap();
        let step4 = step_price(bid, ask, tick, 4, 4, Side::Buy).unwrap();
        assert_eq!(step0, dec!(1.00));
        assert_eq!(step4, dec!(1.20));
    }

    #[test]
    fn step_price_sell_walks_from_ask_to_bid() {
        let bid = dec!(1.00);
        let ask = dec!(1.20);
        let tick = dec!(0.05);
        let step0 = step_price(bid, ask, tick, 0, 4, Side::Sell).unwrap();
        let step4 = step_price(bid, ask, tick, 4, 4, Side::Sell).unwrap();
        assert_eq!(step0, dec!(1.20));
        assert_eq!(step4, dec!(1.00));
    }

    #[test]
    fn step_price_rejects_bad_tick() {
        assert!(step_price(dec!(1), dec!(2), dec!(0), 0, 4, Side::Buy).is_err());
    }
}

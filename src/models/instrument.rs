//! Exchange quantization rules for a symbol.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Lot and tick constraints an order must satisfy.
///
/// Fetched once when an engine connects and never refreshed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRules {
    /// Smallest quantity increment
    pub quantity_step: Decimal,

    /// Minimum order quantity
    pub min_quantity: Decimal,

    /// Maximum order quantity, if the exchange publishes one
    pub max_quantity: Option<Decimal>,

    /// Smallest price increment
    pub price_tick: Decimal,
}

impl InstrumentRules {
    /// Round a raw quantity to the nearest step and clamp it into
    /// `[min_quantity, max_quantity]`.
    pub fn round_quantity(&self, raw: Decimal) -> Decimal {
        let rounded = round_to_step(raw, self.quantity_step);

        if rounded < self.min_quantity {
            return self.min_quantity;
        }
        match self.max_quantity {
            Some(max) if rounded > max => max,
            _ => rounded,
        }
    }

    /// Round a raw price to the nearest tick.
    pub fn round_price(&self, raw: Decimal) -> Decimal {
        round_to_step(raw, self.price_tick)
    }
}

fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (steps * step).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eth_rules() -> InstrumentRules {
        InstrumentRules {
            quantity_step: dec!(0.01),
            min_quantity: dec!(0.01),
            max_quantity: Some(dec!(1500)),
            price_tick: dec!(0.01),
        }
    }

    #[test]
    fn test_round_quantity_to_step() {
        let rules = eth_rules();
        assert_eq!(rules.round_quantity(dec!(0.3449)), dec!(0.34));
        assert_eq!(rules.round_quantity(dec!(0.345)), dec!(0.35));
        assert_eq!(rules.round_quantity(dec!(2)), dec!(2));
    }

    #[test]
    fn test_round_quantity_clamps() {
        let rules = eth_rules();
        assert_eq!(rules.round_quantity(dec!(0.001)), dec!(0.01));
        assert_eq!(rules.round_quantity(Decimal::ZERO), dec!(0.01));
        assert_eq!(rules.round_quantity(dec!(99999)), dec!(1500));

        let unbounded = InstrumentRules {
            max_quantity: None,
            ..eth_rules()
        };
        assert_eq!(unbounded.round_quantity(dec!(99999.004)), dec!(99999));
    }

    #[test]
    fn test_rounded_quantity_is_sound() {
        let rules = InstrumentRules {
            quantity_step: dec!(0.001),
            min_quantity: dec!(0.003),
            max_quantity: Some(dec!(120)),
            price_tick: dec!(0.1),
        };

        let mut raw = Decimal::ZERO;
        while raw < dec!(130) {
            let q = rules.round_quantity(raw);
            assert!((q % rules.quantity_step).is_zero(), "{} not on step", q);
            assert!(q >= rules.min_quantity && q <= dec!(120), "{} out of range", q);
            raw += dec!(0.7371);
        }
    }

    #[test]
    fn test_round_price_to_tick() {
        let rules = InstrumentRules {
            price_tick: dec!(0.5),
            ..eth_rules()
        };
        assert_eq!(rules.round_price(dec!(2000.26)), dec!(2000.5));
        assert_eq!(rules.round_price(dec!(2000.24)), dec!(2000));
    }
}

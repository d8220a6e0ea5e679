//! Limit price rounding by magnitude tier.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round a limit price to the precision exchanges accept for its magnitude:
/// ≥1000 → 2 dp, ≥1 → 4 dp, ≥0.01 → 6 dp, otherwise 8 dp.
pub fn round_price(price: Decimal) -> Decimal {
    let magnitude = price.abs();
    let dp = if magnitude >= Decimal::ONE_THOUSAND {
        2
    } else if magnitude >= Decimal::ONE {
        4
    } else if magnitude >= Decimal::new(1, 2) {
        6
    } else {
        8
    };
    price.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_price_tiers() {
        assert_eq!(round_price(dec!(42123.456)), dec!(42123.46));
        assert_eq!(round_price(dec!(0.00012345)), dec!(0.00012345));
        assert_eq!(round_price(dec!(2.123456)), dec!(2.1235));
        assert_eq!(round_price(dec!(0.0512345678)), dec!(0.051235));
        assert_eq!(round_price(dec!(0.000000001)), dec!(0));
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(round_price(dec!(1000.005)), dec!(1000.01));
        assert_eq!(round_price(dec!(999.99995)), dec!(1000.0000));
        assert_eq!(round_price(dec!(1.00005)), dec!(1.0001));
    }
}

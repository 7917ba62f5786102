//! Decimal helpers for prices and ratios.

use rust_decimal::Decimal;

/// Round down to tick size, so a price cap is never exceeded.
pub fn floor_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).floor() * tick_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_to_tick() {
        assert_eq!(floor_to_tick(dec!(0.539), dec!(0.01)), dec!(0.53));
        assert_eq!(floor_to_tick(dec!(0.53), dec!(0.01)), dec!(0.53));
        assert_eq!(floor_to_tick(dec!(0.5355), dec!(0.001)), dec!(0.535));
        assert_eq!(floor_to_tick(dec!(0.47), Decimal::ZERO), dec!(0.47));
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(100), dec!(4)), dec!(25));
        assert_eq!(safe_div(dec!(100), Decimal::ZERO), Decimal::ZERO);
    }
}

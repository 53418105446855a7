//! Decimal arithmetic utilities for price, volume and weight calculations.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Round a decimal to a specific number of decimal places (midpoint to even).
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Round to the nearest multiple of a tick size (e.g., 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round to the nearest whole lot.
pub fn round_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    round_to_tick(value, lot_size)
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Round to an integer with midpoint-to-even, as used for grid cursors.
pub fn round_to_i64(value: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    value.round().to_i64().unwrap_or(0)
}

/// Convert a sampled `f64` (random jitter, delays) into a decimal.
pub fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Decimal seconds to a `std::time::Duration`, clamped at zero.
pub fn to_duration(secs: Decimal) -> std::time::Duration {
    use rust_decimal::prelude::ToPrimitive;
    let secs = secs.max(Decimal::ZERO).to_f64().unwrap_or(0.0);
    std::time::Duration::from_secs_f64(secs)
}

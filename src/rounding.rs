//! Price/Quantity Step Rounding
//!
//! Exchanges quantize prices to `price_step` and quantities to `qty_step`.
//! Every price and quantity that leaves the order-math layer goes through one
//! of these helpers; intermediate arithmetic stays full-precision.
//!
//! Rounding direction is part of the strategy semantics: bids and long entries
//! round down (never pay more than intended), long closes and short entries
//! round up.

/// Round to the nearest multiple of `step` (half away from zero).
#[inline]
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

/// Round down to a multiple of `step`.
#[inline]
pub fn round_dn(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step + 1e-9).floor() * step
}

/// Round up to a multiple of `step`.
#[inline]
pub fn round_up(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step - 1e-9).ceil() * step
}

/// True when `value` sits on the `step` grid within float tolerance.
#[inline]
pub fn is_step_multiple(value: f64, step: f64) -> bool {
    if step <= 0.0 {
        return true;
    }
    let ratio = value / step;
    (ratio - ratio.round()).abs() < 1e-6
}

/// Smallest quantity the exchange accepts at `price`:
/// `max(min_qty, ceil_to_step(min_cost / price))`.
#[inline]
pub fn min_entry_qty(price: f64, min_qty: f64, min_cost: f64, qty_step: f64, c_mult: f64) -> f64 {
    if price <= 0.0 {
        return min_qty;
    }
    min_qty.max(round_up(min_cost / (price * c_mult), qty_step))
}

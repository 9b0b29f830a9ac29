//! Fill Simulator
//!
//! Intersects the minute's generated orders with each candle's `[low, high]`
//! range and applies executions atomically against positions, balance, and the
//! PnL cumsum.
//!
//! Deterministic application order within a minute: auto-reduce, then the
//! unstuck close, then remaining closes (closest to mark first), then entries
//! (closest to mark first). Ties break on `(symbol, kind code)`. All closes
//! that fit the candle fill; at most one entry per (symbol, side) is ever
//! generated, so entries need no second pass.
//!
//! Market-kind orders execute at the candle open; limit orders execute at
//! their limit price.

use crate::candles::{Candle, MinuteStamp};
use crate::market::MarketRules;
use crate::orders::{Fill, Order, OrderKind, Side};
use crate::position::{realized_pnl, Position, WalletState};
use serde::{Deserialize, Serialize};

/// Fee schedule for simulated executions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FillParams {
    pub maker_fee_rate: f64,
    pub taker_fee_rate: f64,
    pub fee_multiplier: f64,
}

impl FillParams {
    #[inline]
    fn fee(&self, kind: OrderKind, notional: f64) -> f64 {
        let rate = if kind.is_market() {
            self.taker_fee_rate
        } else {
            self.maker_fee_rate
        };
        notional.abs() * rate * self.fee_multiplier
    }
}

/// Execution price for `order` against `candle`, or `None` when the candle
/// never touches it.
pub fn execution_price(order: &Order, candle: &Candle) -> Option<f64> {
    if order.kind.is_market() {
        return Some(candle.open);
    }
    let buys = match (order.side(), order.kind.is_entry()) {
        (Side::Long, true) | (Side::Short, false) => true,
        (Side::Long, false) | (Side::Short, true) => false,
    };
    if buys {
        // Resting bid: touched when the candle trades down through it.
        (candle.low <= order.price).then_some(order.price)
    } else {
        (candle.high >= order.price).then_some(order.price)
    }
}

/// Fill-phase rank implementing the mandated ordering.
#[inline]
fn phase_rank(kind: OrderKind) -> u8 {
    match kind.code() % 12 {
        10 => 0,         // auto-reduce
        9 => 1,          // unstuck
        7 | 8 | 11 => 2, // grid/trailing/panic closes
        _ => 3,          // entries
    }
}

/// Simulate one minute. `orders` is the complete generated set; `marks` holds
/// the per-symbol reference price used for distance sorting; `candles` is the
/// minute row in symbol-index order. Fills are appended to `fills`.
#[allow(clippy::too_many_arguments)]
pub fn simulate_minute(
    ts: MinuteStamp,
    orders: &[Order],
    marks: &[f64],
    candles: &[Candle],
    rules: &[MarketRules],
    positions_long: &mut [Position],
    positions_short: &mut [Position],
    wallet: &mut WalletState,
    params: &FillParams,
    fills: &mut Vec<Fill>,
) -> usize {
    let mut sorted: Vec<&Order> = orders.iter().collect();
    sorted.sort_by(|a, b| {
        let pa = phase_rank(a.kind);
        let pb = phase_rank(b.kind);
        let da = if a.kind.is_market() {
            0.0
        } else {
            (a.price - marks[a.symbol]).abs()
        };
        let db = if b.kind.is_market() {
            0.0
        } else {
            (b.price - marks[b.symbol]).abs()
        };
        pa.cmp(&pb)
            .then(da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.symbol.cmp(&b.symbol))
            .then(a.kind.code().cmp(&b.kind.code()))
    });

    let mut n_fills = 0;
    for order in sorted {
        let candle = &candles[order.symbol];
        let Some(price) = execution_price(order, candle) else {
            continue;
        };
        let market_rules = &rules[order.symbol];
        let positions = match order.side() {
            Side::Long => &mut *positions_long,
            Side::Short => &mut *positions_short,
        };
        let pos = &mut positions[order.symbol];

        if order.kind.is_entry() {
            let notional = order.qty * price * market_rules.c_mult;
            let fee = params.fee(order.kind, notional);
            pos.merge_entry(order.qty, price, ts, market_rules.qty_step);
            pos.trailing.reset(candle.close);
            wallet.apply_fill(0.0, fee);
            fills.push(Fill {
                ts,
                symbol: order.symbol,
                kind: order.kind.code(),
                price,
                qty: order.qty,
                fee,
                realized_pnl: 0.0,
                new_size: pos.size,
                new_price: pos.price,
            });
        } else {
            if !pos.is_open() {
                continue;
            }
            let qty = order.qty.min(pos.size);
            if qty <= 0.0 {
                continue;
            }
            let pnl = realized_pnl(order.side(), qty, price, pos.price, market_rules.c_mult);
            let notional = qty * price * market_rules.c_mult;
            let fee = params.fee(order.kind, notional);
            let went_flat = pos.reduce(qty, market_rules.qty_step);
            if !went_flat {
                pos.trailing.reset(candle.close);
            }
            wallet.apply_fill(pnl, fee);
            fills.push(Fill {
                ts,
                symbol: order.symbol,
                kind: order.kind.code(),
                price,
                qty,
                fee,
                realized_pnl: pnl,
                new_size: pos.size,
                new_price: pos.price,
            });
        }
        n_fills += 1;
    }
    n_fills
}

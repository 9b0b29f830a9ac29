//! Close Order Math
//!
//! Produces the close-order set for one (symbol, side): the grid TP ladder,
//! the trailing close, the exposure-limit auto-reduce, and the panic close.
//! Like the entry math, everything here is pure and returns orders without
//! touching state.
//!
//! Blending reserves allocations: with `close_trailing_grid_ratio = r > 0`
//! the trailing mechanism manages the first `r` share of `full_psize` and the
//! grid ladder the remainder; `r < 0` mirrors with the grid first. Each
//! mechanism only ever sees its own share of the position.

use crate::entries::OrderContext;
use crate::orders::{Order, OrderKind, Side};
use crate::position::BALANCE_FLOOR;
use crate::rounding::{min_entry_qty, round_dn, round_to_step, round_up};

fn close_kind(side: Side, mech: u8) -> OrderKind {
    // mech: 7 grid, 8 trailing, 9 unstuck, 10 auto-reduce, 11 panic.
    OrderKind::from_code(mech + if side == Side::Long { 0 } else { 12 })
        .expect("close mechanism code in range")
}

/// Exchange floor for a close at `price`.
#[inline]
fn min_close_qty(ctx: &OrderContext, price: f64) -> f64 {
    min_entry_qty(
        price,
        ctx.rules.min_qty,
        ctx.rules.min_cost,
        ctx.rules.qty_step,
        ctx.rules.c_mult,
    )
}

/// Position size at exactly WEL: `balance * WEL / (pprice * c_mult)`.
#[inline]
pub fn full_psize(ctx: &OrderContext) -> f64 {
    ctx.balance * ctx.wel / (ctx.pos.price * ctx.rules.c_mult).max(BALANCE_FLOOR)
}

/// Close price: clamped to the mark (a close never rests inside the spread's
/// wrong side) and rounded onto the grid. Long closes round up, short closes
/// round down.
fn close_price(ctx: &OrderContext, raw: f64) -> f64 {
    match ctx.side {
        Side::Long => round_up(ctx.mark.max(raw), ctx.rules.price_step),
        Side::Short => round_dn(ctx.mark.min(raw), ctx.rules.price_step),
    }
}

/// Markup of TP rung `i` out of `n_levels`. Negative spacing (start > end)
/// yields the reversed, higher-profit-first ladder.
fn rung_markup(cfg: &crate::config::SideConfig, i: usize, n_levels: usize) -> f64 {
    let spacing = if n_levels > 1 {
        (cfg.close_grid_markup_end - cfg.close_grid_markup_start) / (n_levels - 1) as f64
    } else {
        0.0
    };
    cfg.close_grid_markup_start + i as f64 * spacing
}

/// Grid TP ladder over an allocated share of the position.
///
/// Rungs are spaced linearly from `markup_start` to `markup_end`; the number
/// of rungs in play follows the exposure ratio of the allocation. The
/// leftover above `full_psize` is folded into the first rung; residual dust
/// below the exchange minimum is absorbed into the final rung so the ladder
/// always sums to the allocation.
pub fn close_grid(ctx: &OrderContext, alloc: f64) -> Vec<Order> {
    let mut orders = Vec::new();
    if alloc <= 0.0 || !ctx.pos.is_open() {
        return orders;
    }
    let pprice = ctx.pos.price;
    let full = full_psize(ctx);
    let leftover = (alloc - full).max(0.0);
    let qty_pct = ctx.cfg.close_grid_qty_pct;

    // Whole allocation at the first markup when a single slice covers it.
    if qty_pct >= 1.0 {
        let price = close_price(
            ctx,
            pprice * markup_factor(ctx.side, ctx.cfg.close_grid_markup_start),
        );
        orders.push(Order {
            symbol: ctx.symbol,
            kind: close_kind(ctx.side, 7),
            price,
            qty: round_to_step(alloc, ctx.rules.qty_step),
        });
        return orders;
    }

    let n_levels = (1.0 / qty_pct).ceil() as usize;
    let alloc_ratio =
        alloc * pprice * ctx.rules.c_mult / (ctx.wel * ctx.balance).max(BALANCE_FLOOR);
    let n_active = ((alloc_ratio * n_levels as f64).ceil() as usize).clamp(1, n_levels);

    let mut remaining = alloc;
    for i in 0..n_active {
        if remaining <= 0.0 {
            break;
        }
        let price = close_price(
            ctx,
            pprice * markup_factor(ctx.side, rung_markup(ctx.cfg, i, n_levels)),
        );
        let floor = min_close_qty(ctx, price);
        let mut qty = floor.max(round_up(
            full * qty_pct + if i == 0 { leftover } else { 0.0 },
            ctx.rules.qty_step,
        ));
        // Absorb residual dust rather than stranding a sub-minimum rung; the
        // final rung always takes whatever is left.
        let residual = remaining - qty;
        if (residual > 0.0 && residual < floor) || i == n_active - 1 {
            qty = remaining;
        }
        qty = qty.min(remaining);
        let qty = round_to_step(qty, ctx.rules.qty_step);
        if qty <= 0.0 {
            break;
        }
        orders.push(Order {
            symbol: ctx.symbol,
            kind: close_kind(ctx.side, 7),
            price,
            qty,
        });
        remaining -= qty;
    }
    orders
}

#[inline]
fn markup_factor(side: Side, markup: f64) -> f64 {
    match side {
        Side::Long => 1.0 + markup,
        Side::Short => 1.0 - markup,
    }
}

/// Trailing close over an allocated share of the position. Mirrors the
/// trailing entry in the profitable direction.
pub fn close_trailing(ctx: &OrderContext, alloc: f64) -> Option<Order> {
    if alloc <= 0.0 || !ctx.pos.is_open() {
        return None;
    }
    let th = ctx.cfg.close_trailing_threshold_pct;
    let rt = ctx.cfg.close_trailing_retracement_pct;
    let t = &ctx.pos.trailing;
    let pprice = ctx.pos.price;

    let (triggered, raw_price) = match ctx.side {
        Side::Long => {
            if th <= 0.0 && rt <= 0.0 {
                (true, ctx.mark)
            } else if th <= 0.0 {
                (t.min_since_max < t.max_since_open * (1.0 - rt), ctx.mark)
            } else if rt <= 0.0 {
                (true, pprice * (1.0 + th))
            } else {
                (
                    t.max_since_open > pprice * (1.0 + th)
                        && t.min_since_max < t.max_since_open * (1.0 - rt),
                    pprice * (1.0 + th - rt),
                )
            }
        }
        Side::Short => {
            if th <= 0.0 && rt <= 0.0 {
                (true, ctx.mark)
            } else if th <= 0.0 {
                (t.max_since_min > t.min_since_open * (1.0 + rt), ctx.mark)
            } else if rt <= 0.0 {
                (true, pprice * (1.0 - th))
            } else {
                (
                    t.min_since_open < pprice * (1.0 - th)
                        && t.max_since_min > t.min_since_open * (1.0 + rt),
                    pprice * (1.0 - th + rt),
                )
            }
        }
    };
    if !triggered {
        return None;
    }

    let price = close_price(ctx, raw_price);
    let full = full_psize(ctx);
    let qty = round_to_step(
        alloc.min(
            min_close_qty(ctx, price)
                .max(round_up(full * ctx.cfg.close_trailing_qty_pct, ctx.rules.qty_step)),
        ),
        ctx.rules.qty_step,
    );
    if qty <= 0.0 {
        return None;
    }
    Some(Order {
        symbol: ctx.symbol,
        kind: close_kind(ctx.side, 8),
        price,
        qty,
    })
}

/// Market-price close of the exposure excess when the per-position limit is
/// breached beyond tolerance. Emitted before any other close.
pub fn auto_reduce(ctx: &OrderContext) -> Option<Order> {
    if !ctx.cfg.enforce_exposure_limit || !ctx.pos.is_open() {
        return None;
    }
    let we = ctx.wallet_exposure();
    if we <= ctx.wel * 1.01 {
        return None;
    }
    // Bring WE back down to WEL exactly, floored at the exchange minimum so
    // a marginal excess still produces an acceptable order.
    let target_size = ctx.wel * ctx.balance / (ctx.pos.price * ctx.rules.c_mult);
    let qty = round_up(ctx.pos.size - target_size, ctx.rules.qty_step)
        .max(min_close_qty(ctx, ctx.mark))
        .min(ctx.pos.size);
    if qty <= 0.0 {
        return None;
    }
    Some(Order {
        symbol: ctx.symbol,
        kind: close_kind(ctx.side, 10),
        price: ctx.mark,
        qty,
    })
}

/// Full-size market close (forced mode `p`).
pub fn panic_close(ctx: &OrderContext) -> Option<Order> {
    if !ctx.pos.is_open() {
        return None;
    }
    Some(Order {
        symbol: ctx.symbol,
        kind: close_kind(ctx.side, 11),
        price: ctx.mark,
        qty: ctx.pos.size,
    })
}

/// The close-order set for this minute (unstuck excluded; the scheduler picks
/// at most one unstuck order across all positions).
pub fn next_closes(ctx: &OrderContext) -> Vec<Order> {
    let mut orders = Vec::new();
    if !ctx.pos.is_open() {
        return orders;
    }
    if let Some(reduce) = auto_reduce(ctx) {
        orders.push(reduce);
    }

    let r = ctx.cfg.close_trailing_grid_ratio;
    let size = ctx.pos.size;
    let full = full_psize(ctx);
    let (trailing_alloc, grid_alloc) = if r == 0.0 {
        (0.0, size)
    } else if r.abs() >= 1.0 {
        (size, 0.0)
    } else if r > 0.0 {
        // Trailing manages the first r share of a full position.
        let t = size.min(full * r);
        (t, size - t)
    } else {
        let g = size.min(full * (1.0 + r));
        (size - g, g)
    };

    if let Some(order) = close_trailing(ctx, round_to_step(trailing_alloc, ctx.rules.qty_step)) {
        orders.push(order);
    }
    orders.extend(close_grid(ctx, round_to_step(grid_alloc, ctx.rules.qty_step)));
    orders
}

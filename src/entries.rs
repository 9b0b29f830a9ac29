//! Entry Order Math
//!
//! Pure functions producing the *next* entry order for one (symbol, side):
//! initial entry off the EMA band, grid re-entry with exposure-weighted
//! spacing (plus crop/inflate adjustments at the exposure boundary), and
//! trailing re-entry off the retracement tracker. `next_entry` selects the
//! mechanism per the trailing/grid blend ratio.
//!
//! All functions borrow state read-only and return a tagged `OrderOutcome`;
//! they never mutate positions or balance.

use crate::config::SideConfig;
use crate::ema::EmaBands;
use crate::market::{MarketRules, SymbolIdx};
use crate::orders::{Order, OrderKind, OrderOutcome, Side, SkipReason};
use crate::position::Position;
use crate::rounding::{min_entry_qty, round_dn, round_to_step, round_up};

/// Read-only inputs for one (symbol, side) order computation this minute.
#[derive(Debug, Clone, Copy)]
pub struct OrderContext<'a> {
    pub side: Side,
    pub symbol: SymbolIdx,
    pub cfg: &'a SideConfig,
    pub rules: &'a MarketRules,
    pub balance: f64,
    /// Per-position wallet exposure limit (`TWEL / effective_n_positions`).
    pub wel: f64,
    /// Bid == ask == previous minute's close in the candle fill model.
    pub mark: f64,
    pub bands: Option<EmaBands>,
    /// Hourly log-range EMA for grid-spacing modulation.
    pub grid_log_range: f64,
    pub pos: &'a Position,
}

impl<'a> OrderContext<'a> {
    #[inline]
    pub fn wallet_exposure(&self) -> f64 {
        self.pos.wallet_exposure(self.balance, self.rules)
    }

    /// Exchange floor for an entry at `price`.
    #[inline]
    fn min_qty_at(&self, price: f64) -> f64 {
        min_entry_qty(
            price,
            self.rules.min_qty,
            self.rules.min_cost,
            self.rules.qty_step,
            self.rules.c_mult,
        )
    }

    /// Initial-entry target qty at `price`:
    /// `balance * WEL * entry_initial_qty_pct / (price * c_mult)`.
    #[inline]
    fn initial_qty_at(&self, price: f64) -> f64 {
        self.balance * self.wel * self.cfg.entry_initial_qty_pct
            / (price * self.rules.c_mult)
    }

    /// Quantity still placeable before WE reaches WEL, at `price`.
    #[inline]
    fn exposure_budget_qty(&self, price: f64) -> f64 {
        let budget_notional =
            self.wel * self.balance - self.pos.size * self.pos.price * self.rules.c_mult;
        budget_notional / (price * self.rules.c_mult)
    }
}

fn entry_kind(side: Side, mech: u8) -> OrderKind {
    // mech: 0 initial-normal, 1 initial-partial, 2 grid-normal,
    // 3 grid-cropped, 4 grid-inflated, 5 trailing-normal, 6 trailing-cropped.
    OrderKind::from_code(mech + if side == Side::Long { 0 } else { 12 })
        .expect("entry mechanism code in range")
}

/// Initial entry: anchored to the EMA band, sized as a fraction of the
/// per-position budget. Emitted while the position is below 80% of the
/// target initial size.
pub fn initial_entry(ctx: &OrderContext) -> OrderOutcome {
    let Some(bands) = ctx.bands else {
        return OrderOutcome::Skip(SkipReason::WarmingUp);
    };
    // Rounding after the mark clamp keeps the emitted price on the grid even
    // when the mark wins the comparison.
    let price = match ctx.side {
        Side::Long => round_dn(
            ctx.mark
                .min(bands.lower * (1.0 - ctx.cfg.entry_initial_ema_dist)),
            ctx.rules.price_step,
        ),
        Side::Short => round_up(
            ctx.mark
                .max(bands.upper * (1.0 + ctx.cfg.entry_initial_ema_dist)),
            ctx.rules.price_step,
        ),
    };
    if price <= 0.0 {
        return OrderOutcome::Skip(SkipReason::BelowMinCost);
    }

    let qty = ctx
        .min_qty_at(price)
        .max(round_to_step(ctx.initial_qty_at(price), ctx.rules.qty_step));
    if ctx.pos.size >= 0.8 * qty {
        return OrderOutcome::Skip(SkipReason::AlreadyEntered);
    }
    let mech = if ctx.pos.is_open() { 1 } else { 0 };
    OrderOutcome::Emit(Order {
        symbol: ctx.symbol,
        kind: entry_kind(ctx.side, mech),
        price,
        qty,
    })
}

/// Grid spacing multiplier: `max(0, 1 + (WE/WEL)*we_weight + log_range*log_weight)`.
fn spacing_mult(cfg: &SideConfig, we_ratio: f64, log_range: f64) -> f64 {
    (1.0 + we_ratio * cfg.entry_grid_spacing_we_weight
        + log_range * cfg.entry_grid_spacing_log_weight)
        .max(0.0)
}

fn grid_price(ctx: &OrderContext, pprice: f64, mult: f64) -> f64 {
    match ctx.side {
        Side::Long => round_dn(
            ctx.mark
                .min(pprice * (1.0 - ctx.cfg.entry_grid_spacing_pct * mult)),
            ctx.rules.price_step,
        ),
        Side::Short => round_up(
            ctx.mark
                .max(pprice * (1.0 + ctx.cfg.entry_grid_spacing_pct * mult)),
            ctx.rules.price_step,
        ),
    }
}

/// Re-entry qty before exposure adjustments: the larger of the double-down
/// and the initial-entry floor, quantized.
fn reentry_qty(ctx: &OrderContext, price: f64, double_down_factor: f64) -> f64 {
    ctx.min_qty_at(price).max(round_to_step(
        (ctx.pos.size * double_down_factor).max(ctx.initial_qty_at(price)),
        ctx.rules.qty_step,
    ))
}

/// Crop a re-entry so the post-fill exposure lands exactly on WEL.
/// Returns `None` when even the exchange minimum no longer fits.
fn crop_to_limit(ctx: &OrderContext, price: f64) -> Option<f64> {
    let qty = round_dn(ctx.exposure_budget_qty(price), ctx.rules.qty_step);
    if qty + 1e-12 < ctx.min_qty_at(price) {
        None
    } else {
        Some(qty)
    }
}

/// Grid re-entry with crop and inflate handling.
pub fn grid_reentry(ctx: &OrderContext) -> OrderOutcome {
    if !ctx.pos.is_open() {
        return OrderOutcome::Skip(SkipReason::NoPosition);
    }
    let we = ctx.wallet_exposure();
    let ratio = we / ctx.wel;
    if ratio >= 1.0 {
        return OrderOutcome::Skip(SkipReason::ExposureFull);
    }

    let mult = spacing_mult(ctx.cfg, ratio, ctx.grid_log_range);
    let price = grid_price(ctx, ctx.pos.price, mult);
    if price <= 0.0 {
        return OrderOutcome::Skip(SkipReason::BelowMinCost);
    }
    let ddf = ctx.cfg.entry_grid_double_down_factor;
    let qty = reentry_qty(ctx, price, ddf);

    // Would this fill overshoot the per-position limit?
    let we_after = (ctx.pos.size * ctx.pos.price + qty * price) * ctx.rules.c_mult
        / ctx.balance.max(crate::position::BALANCE_FLOOR);
    if we_after > ctx.wel * 1.01 {
        return match crop_to_limit(ctx, price) {
            Some(cropped) => OrderOutcome::Emit(Order {
                symbol: ctx.symbol,
                kind: entry_kind(ctx.side, 3),
                price,
                qty: cropped,
            }),
            None => OrderOutcome::Skip(SkipReason::BelowMinCost),
        };
    }

    // Forward-simulate the merge and look at the step after this one: when
    // the remaining budget would only fit a runt re-entry, take the whole
    // budget now instead.
    let merged_size = round_to_step(ctx.pos.size + qty, ctx.rules.qty_step);
    let merged_price = ctx.pos.price * (ctx.pos.size / merged_size)
        + price * (qty / merged_size);
    let merged_we =
        merged_size * merged_price * ctx.rules.c_mult / ctx.balance.max(crate::position::BALANCE_FLOOR);
    let next_mult = spacing_mult(ctx.cfg, merged_we / ctx.wel, ctx.grid_log_range);
    let next_price = grid_price(ctx, merged_price, next_mult);
    if next_price > 0.0 {
        let next_budget_qty = (ctx.wel * ctx.balance
            - merged_size * merged_price * ctx.rules.c_mult)
            / (next_price * ctx.rules.c_mult);
        if next_budget_qty < 0.25 * ddf * ctx.pos.size {
            if let Some(inflated) = crop_to_limit(ctx, price) {
                if inflated > qty {
                    return OrderOutcome::Emit(Order {
                        symbol: ctx.symbol,
                        kind: entry_kind(ctx.side, 4),
                        price,
                        qty: inflated,
                    });
                }
            }
        }
    }

    OrderOutcome::Emit(Order {
        symbol: ctx.symbol,
        kind: entry_kind(ctx.side, 2),
        price,
        qty,
    })
}

/// Trailing re-entry. Threshold (`th`) arms the mechanism at a distance from
/// the position price; retracement (`rt`) requires a bounce off the extreme.
/// Either leg degenerates gracefully when its parameter is <= 0.
pub fn trailing_entry(ctx: &OrderContext) -> OrderOutcome {
    if !ctx.pos.is_open() {
        return OrderOutcome::Skip(SkipReason::NoPosition);
    }
    let we = ctx.wallet_exposure();
    if we / ctx.wel >= 1.0 {
        return OrderOutcome::Skip(SkipReason::ExposureFull);
    }

    let th = ctx.cfg.entry_trailing_threshold_pct;
    let rt = ctx.cfg.entry_trailing_retracement_pct;
    let t = &ctx.pos.trailing;
    let pprice = ctx.pos.price;

    // (triggered, raw price) in the long convention, mirrored below.
    let (triggered, raw_price) = match ctx.side {
        Side::Long => {
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
        Side::Short => {
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
    };
    if !triggered {
        return OrderOutcome::Skip(SkipReason::TriggerNotMet);
    }

    let price = match ctx.side {
        Side::Long => round_dn(ctx.mark.min(raw_price), ctx.rules.price_step),
        Side::Short => round_up(ctx.mark.max(raw_price), ctx.rules.price_step),
    };
    if price <= 0.0 {
        return OrderOutcome::Skip(SkipReason::BelowMinCost);
    }

    let qty = reentry_qty(ctx, price, ctx.cfg.entry_trailing_double_down_factor);
    let we_after = (ctx.pos.size * ctx.pos.price + qty * price) * ctx.rules.c_mult
        / ctx.balance.max(crate::position::BALANCE_FLOOR);
    if we_after > ctx.wel * 1.01 {
        return match crop_to_limit(ctx, price) {
            Some(cropped) => OrderOutcome::Emit(Order {
                symbol: ctx.symbol,
                kind: entry_kind(ctx.side, 6),
                price,
                qty: cropped,
            }),
            None => OrderOutcome::Skip(SkipReason::BelowMinCost),
        };
    }

    OrderOutcome::Emit(Order {
        symbol: ctx.symbol,
        kind: entry_kind(ctx.side, 5),
        price,
        qty,
    })
}

/// Select this minute's entry order.
///
/// A flat (or sub-initial) position always goes through the initial-entry
/// path. Otherwise `entry_trailing_grid_ratio` blends the mechanisms:
/// `0` grid only, `±1` trailing only, positive = trailing first until
/// `WE/WEL >= r`, negative = grid first until `WE/WEL >= 1 + r`.
pub fn next_entry(ctx: &OrderContext) -> OrderOutcome {
    match initial_entry(ctx) {
        OrderOutcome::Emit(order) => return OrderOutcome::Emit(order),
        OrderOutcome::Skip(SkipReason::AlreadyEntered) => {}
        skip => return skip,
    }

    let r = ctx.cfg.entry_trailing_grid_ratio;
    let ratio = ctx.wallet_exposure() / ctx.wel;
    let use_trailing = if r == 0.0 {
        false
    } else if r.abs() >= 1.0 {
        true
    } else if r > 0.0 {
        ratio < r
    } else {
        ratio >= 1.0 + r
    };

    if use_trailing {
        trailing_entry(ctx)
    } else {
        grid_reentry(ctx)
    }
}

//! Unstuck Scheduler
//!
//! Positions whose exposure is deep relative to their limit and whose TP grid
//! sits out of reach are "stuck". The scheduler grants a cross-position loss
//! budget derived from drawdown below peak balance and realizes a small
//! controlled loss near the EMA band, one position per minute, preferring the
//! position closest to breaking even.

use crate::entries::OrderContext;
use crate::orders::{Order, OrderKind, Side};
use crate::position::WalletState;
use crate::rounding::{min_entry_qty, round_dn, round_up};
use crate::closes::full_psize;

/// Remaining loss budget:
/// `max(0, peak_balance * (allowance_pct * TWEL + balance/peak_balance - 1))`.
///
/// The budget shrinks with drawdown; at `allowance_pct * TWEL` below peak it
/// reaches zero and unstucking stops entirely.
pub fn loss_allowance(wallet: &WalletState, allowance_pct: f64, twel: f64) -> f64 {
    let peak = wallet.peak_balance();
    if peak <= 0.0 {
        return 0.0;
    }
    let drop = wallet.balance / peak - 1.0;
    (peak * (allowance_pct * twel + drop)).max(0.0)
}

/// Is this position stuck? Exposure ratio beyond the threshold and the active
/// (first) TP rung on the wrong side of the mark.
pub fn is_stuck(ctx: &OrderContext) -> bool {
    if !ctx.pos.is_open() {
        return false;
    }
    if ctx.wallet_exposure() / ctx.wel <= ctx.cfg.unstuck_threshold {
        return false;
    }
    let markup = ctx.cfg.close_grid_markup_start;
    match ctx.side {
        Side::Long => ctx.pos.price * (1.0 + markup) > ctx.mark,
        Side::Short => ctx.pos.price * (1.0 - markup) < ctx.mark,
    }
}

/// A stuck position's would-be unstuck close, with its selection key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnstuckCandidate {
    pub order: Order,
    /// Relative distance from mark to position price; the scheduler picks the
    /// smallest gap (nearest to profit).
    pub gap: f64,
}

/// Build the unstuck close for one (symbol, side), if the position qualifies
/// and the budget permits a meaningful close.
pub fn unstuck_candidate(ctx: &OrderContext, allowance: f64) -> Option<UnstuckCandidate> {
    if allowance <= 0.0 || !is_stuck(ctx) {
        return None;
    }
    let bands = ctx.bands?;

    // Clamped to the mark, rounded onto the grid after the clamp.
    let price = match ctx.side {
        Side::Long => round_up(
            ctx.mark
                .max(bands.upper * (1.0 + ctx.cfg.unstuck_ema_dist)),
            ctx.rules.price_step,
        ),
        Side::Short => round_dn(
            ctx.mark
                .min(bands.lower * (1.0 - ctx.cfg.unstuck_ema_dist)),
            ctx.rules.price_step,
        ),
    };
    if price <= 0.0 {
        return None;
    }

    let mut qty = ctx
        .pos
        .size
        .min(round_up(full_psize(ctx) * ctx.cfg.unstuck_close_pct, ctx.rules.qty_step));

    // Cap the realized loss at the remaining allowance.
    let loss_per_unit = match ctx.side {
        Side::Long => (ctx.pos.price - price) * ctx.rules.c_mult,
        Side::Short => (price - ctx.pos.price) * ctx.rules.c_mult,
    };
    if loss_per_unit > 0.0 {
        let max_qty = round_dn(allowance / loss_per_unit, ctx.rules.qty_step);
        qty = qty.min(max_qty);
    }

    let floor = min_entry_qty(
        price,
        ctx.rules.min_qty,
        ctx.rules.min_cost,
        ctx.rules.qty_step,
        ctx.rules.c_mult,
    );
    if qty < floor {
        return None;
    }

    let kind = match ctx.side {
        Side::Long => OrderKind::CloseUnstuckLong,
        Side::Short => OrderKind::CloseUnstuckShort,
    };
    Some(UnstuckCandidate {
        order: Order {
            symbol: ctx.symbol,
            kind,
            price,
            qty,
        },
        gap: (ctx.mark - ctx.pos.price).abs() / ctx.pos.price,
    })
}

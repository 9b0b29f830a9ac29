//! Seed scenarios and boundary behaviors for the order engine, exercised
//! end to end through the public order-math API and the driver.

use crate::candles::Candle;
use crate::config::{BotConfig, SideConfig};
use crate::ema::EmaBands;
use crate::engine::Backtest;
use crate::entries::{initial_entry, next_entry, OrderContext};
use crate::closes::next_closes;
use crate::market::MarketRules;
use crate::orders::{OrderKind, OrderOutcome, Side};
use crate::position::Position;
use crate::rounding::round_to_step;
use crate::synthetic::{generate, SyntheticConfig};
use crate::unstuck::is_stuck;

fn rules() -> MarketRules {
    MarketRules {
        price_step: 0.01,
        qty_step: 0.001,
        min_qty: 0.001,
        min_cost: 1.0,
        c_mult: 1.0,
    }
}

fn base_ctx<'a>(
    cfg: &'a SideConfig,
    market_rules: &'a MarketRules,
    pos: &'a Position,
    balance: f64,
    wel: f64,
    mark: f64,
    bands: Option<EmaBands>,
) -> OrderContext<'a> {
    OrderContext {
        side: Side::Long,
        symbol: 0,
        cfg,
        rules: market_rules,
        balance,
        wel,
        mark,
        bands,
        grid_log_range: 0.0,
        pos,
    }
}

/// S1: initial entry pricing and sizing off the lower band.
#[test]
fn scenario_initial_entry_pricing() {
    let cfg = SideConfig {
        entry_initial_qty_pct: 0.15,
        entry_initial_ema_dist: -0.01,
        total_wallet_exposure_limit: 2.0,
        n_positions: 1,
        ..SideConfig::default()
    };
    let market_rules = rules();
    let pos = Position::default();
    let bands = Some(EmaBands {
        upper: 103.0,
        lower: 100.0,
    });
    // balance 1000, TWEL 2.0, n_positions 1 -> WEL 2.0; bid 101.
    let ctx = base_ctx(&cfg, &market_rules, &pos, 1000.0, 2.0, 101.0, bands);
    let order = initial_entry(&ctx).order().unwrap();

    // price = min(bid, round_dn(100 * (1 - (-0.01)))) = min(101, 101) = 101
    assert!((order.price - 101.0).abs() < 1e-9);
    // qty = round(1000 * 2.0 * 0.15 / 101, 0.001)
    let expected_qty = round_to_step(1000.0 * 2.0 * 0.15 / 101.0, 0.001);
    assert!((order.qty - expected_qty).abs() < 1e-9);
}

/// Property 8: with n_positions = 1 and TWEL = 1.0, the initial qty reduces
/// to `round(balance * pct / price, qty_step)`.
#[test]
fn boundary_initial_qty_formula() {
    let cfg = SideConfig {
        entry_initial_qty_pct: 0.2,
        entry_initial_ema_dist: 0.0,
        total_wallet_exposure_limit: 1.0,
        n_positions: 1,
        ..SideConfig::default()
    };
    let market_rules = rules();
    let pos = Position::default();
    let bands = Some(EmaBands {
        upper: 101.0,
        lower: 100.0,
    });
    let ctx = base_ctx(&cfg, &market_rules, &pos, 500.0, 1.0, 100.5, bands);
    let order = initial_entry(&ctx).order().unwrap();
    assert!((order.price - 100.0).abs() < 1e-9);
    assert!((order.qty - round_to_step(500.0 * 0.2 / 100.0, 0.001)).abs() < 1e-9);
}

/// S6: the eligible set shrinking below `n_positions` grows each position's
/// limit; symbols outside the set stop entering but keep closing.
#[test]
fn scenario_dynamic_wallet_exposure_limit() {
    use crate::filters::FilterBank;

    let cfg = SideConfig {
        n_positions: 5,
        total_wallet_exposure_limit: 2.0,
        filter_volume_ema_span: 10.0,
        filter_log_range_ema_span: 10.0,
        ..SideConfig::default()
    };
    // Universe of two symbols only.
    let mut bank = FilterBank::new(2, &cfg);
    for m in 0..10 {
        bank.update_minute(
            m,
            &[
                Candle {
                    open: 100.0,
                    high: 102.0,
                    low: 100.0,
                    close: 101.0,
                    volume: 1000.0,
                },
                Candle {
                    open: 50.0,
                    high: 50.5,
                    low: 50.0,
                    close: 50.2,
                    volume: 800.0,
                },
            ],
        );
    }
    let eligibility = bank.select_eligible(&[false, false]);
    assert_eq!(eligibility.effective_n_positions, 2);
    assert!((eligibility.wallet_exposure_limit(2.0) - 1.0).abs() < 1e-12);
}

/// Property 9: `trailing_grid_ratio = 0` never emits trailing orders.
#[test]
fn boundary_ratio_zero_suppresses_trailing() {
    let mut config = BotConfig::default();
    config.long.ema_span_0 = 30.0;
    config.long.ema_span_1 = 60.0;
    config.long.n_positions = 2;
    config.long.entry_initial_qty_pct = 0.05;
    config.long.entry_trailing_grid_ratio = 0.0;
    config.long.close_trailing_grid_ratio = 0.0;

    let market = generate(&SyntheticConfig {
        n_minutes: 3000,
        volatility: 0.004,
        ..Default::default()
    });
    let report = Backtest::new(config, &market.symbols, &market.market_map, &market.grid)
        .unwrap()
        .run()
        .unwrap();
    for fill in &report.fills {
        let kind = OrderKind::from_code(fill.kind).unwrap();
        assert!(
            !matches!(
                kind,
                OrderKind::EntryTrailingNormalLong
                    | OrderKind::EntryTrailingCroppedLong
                    | OrderKind::CloseTrailingNormalLong
            ),
            "trailing fill emitted with ratio 0: {:?}",
            kind
        );
    }
}

/// Property 10: `trailing_grid_ratio = 1` never emits grid orders (the
/// initial entry is not a grid order).
#[test]
fn boundary_ratio_one_suppresses_grid() {
    let mut config = BotConfig::default();
    config.long.ema_span_0 = 30.0;
    config.long.ema_span_1 = 60.0;
    config.long.n_positions = 2;
    config.long.entry_initial_qty_pct = 0.05;
    config.long.entry_trailing_grid_ratio = 1.0;
    config.long.close_trailing_grid_ratio = 1.0;
    // Degenerate trailing params: immediate re-entries/closes.
    config.long.entry_trailing_threshold_pct = 0.0;
    config.long.entry_trailing_retracement_pct = 0.0;
    config.long.close_trailing_threshold_pct = 0.0;
    config.long.close_trailing_retracement_pct = 0.0;

    let market = generate(&SyntheticConfig {
        n_minutes: 3000,
        volatility: 0.004,
        ..Default::default()
    });
    let report = Backtest::new(config, &market.symbols, &market.market_map, &market.grid)
        .unwrap()
        .run()
        .unwrap();
    for fill in &report.fills {
        let kind = OrderKind::from_code(fill.kind).unwrap();
        assert!(
            !matches!(
                kind,
                OrderKind::EntryGridNormalLong
                    | OrderKind::EntryGridCroppedLong
                    | OrderKind::EntryGridInflatedLong
                    | OrderKind::CloseGridNormalLong
            ),
            "grid fill emitted with ratio 1: {:?}",
            kind
        );
    }
}

/// Property 11: beyond the exposure tolerance, the close set leads with
/// auto-reduce.
#[test]
fn boundary_auto_reduce_leads_close_set() {
    let cfg = SideConfig {
        enforce_exposure_limit: true,
        total_wallet_exposure_limit: 1.0,
        n_positions: 1,
        ..SideConfig::default()
    };
    let market_rules = rules();
    let mut pos = Position::default();
    pos.merge_entry(12.0, 100.0, 0, market_rules.qty_step); // WE 1.2 vs WEL 1.0
    let ctx = base_ctx(&cfg, &market_rules, &pos, 1000.0, 1.0, 100.0, None);
    let orders = next_closes(&ctx);
    assert!(!orders.is_empty());
    assert_eq!(orders[0].kind, OrderKind::CloseAutoReduceLong);
}

/// Property 12: no unstuck below the exposure threshold.
#[test]
fn boundary_no_unstuck_below_threshold() {
    let cfg = SideConfig {
        unstuck_threshold: 0.9,
        total_wallet_exposure_limit: 1.0,
        n_positions: 1,
        ..SideConfig::default()
    };
    let market_rules = rules();
    let mut pos = Position::default();
    pos.merge_entry(8.0, 100.0, 0, market_rules.qty_step); // WE 0.8 < threshold
    // Deep under water, yet below the exposure threshold: not stuck.
    let ctx = base_ctx(&cfg, &market_rules, &pos, 1000.0, 1.0, 50.0, None);
    assert!(!is_stuck(&ctx));
}

/// Property 7: a zero-range candle fills at most one direction.
#[test]
fn boundary_flat_candle_single_direction() {
    use crate::fills::execution_price;
    use crate::orders::Order;

    let entry = Order {
        symbol: 0,
        kind: OrderKind::EntryGridNormalLong,
        price: 99.0,
        qty: 1.0,
    };
    let close = Order {
        symbol: 0,
        kind: OrderKind::CloseGridNormalLong,
        price: 101.0,
        qty: 1.0,
    };
    let flat = |p: f64| Candle {
        open: p,
        high: p,
        low: p,
        close: p,
        volume: 1.0,
    };

    // Between the two prices: neither side fills.
    assert!(execution_price(&entry, &flat(100.0)).is_none());
    assert!(execution_price(&close, &flat(100.0)).is_none());
    // At the entry: only the entry fills.
    assert!(execution_price(&entry, &flat(99.0)).is_some());
    assert!(execution_price(&close, &flat(99.0)).is_none());
    // At the close: only the close fills.
    assert!(execution_price(&entry, &flat(101.0)).is_none());
    assert!(execution_price(&close, &flat(101.0)).is_some());
}

/// Entries stay suppressed while a side is in graceful stop, but positions
/// keep closing (exercised through the forced-mode path).
#[test]
fn graceful_stop_closes_only() {
    let mut config = BotConfig::default();
    config.long.ema_span_0 = 30.0;
    config.long.ema_span_1 = 60.0;
    config.long.n_positions = 2;
    config.long.entry_initial_qty_pct = 0.05;
    config.forced_mode_long = crate::config::ForcedMode::GracefulStop;

    let market = generate(&SyntheticConfig {
        n_minutes: 2000,
        volatility: 0.004,
        ..Default::default()
    });
    let report = Backtest::new(config, &market.symbols, &market.market_map, &market.grid)
        .unwrap()
        .run()
        .unwrap();
    // No position ever opens, so no fills at all on either side.
    assert!(report
        .fills
        .iter()
        .all(|f| !OrderKind::from_code(f.kind).unwrap().is_entry()));
    assert!(report.fills.is_empty());
}

/// `next_entry` flows into the grid path once a position exists and the
/// blend ratio is zero (the common default).
#[test]
fn entry_selector_grid_default() {
    let cfg = SideConfig {
        entry_initial_qty_pct: 0.1,
        total_wallet_exposure_limit: 1.0,
        n_positions: 1,
        ..SideConfig::default()
    };
    let market_rules = rules();
    let mut pos = Position::default();
    pos.merge_entry(2.0, 100.0, 0, market_rules.qty_step);
    let bands = Some(EmaBands {
        upper: 101.0,
        lower: 99.0,
    });
    let ctx = base_ctx(&cfg, &market_rules, &pos, 1000.0, 1.0, 100.0, bands);
    match next_entry(&ctx) {
        OrderOutcome::Emit(order) => {
            assert_eq!(order.kind, OrderKind::EntryGridNormalLong)
        }
        other => panic!("expected a grid re-entry, got {:?}", other),
    }
}

//! Backtest Driver
//!
//! Owns all mutable state and drives the fixed per-minute phase order:
//!
//! 1. ingest candle row, advance clock
//! 2. update EMA bands and filter EMAs
//! 3. recompute eligibility and the per-position exposure limit
//! 4. update trailing extrema
//! 5. generate the per-symbol order set (one unstuck order at most, globally)
//! 6. simulate fills (auto-reduce → unstuck → closes → entries)
//! 7. commit balance/PnL, check bankruptcy
//! 8. record observations; check invariants; honor the halt flag
//!
//! No state crosses a minute boundary without being committed in phase 7.
//! Independent runs are embarrassingly parallel (`run_many`); within a run
//! there is no concurrency.

use crate::candles::{CandleGrid, MinuteStamp};
use crate::closes::{next_closes, panic_close};
use crate::config::{BotConfig, ForcedMode, SideConfig};
use crate::ema::EmaTracker;
use crate::entries::{next_entry, OrderContext};
use crate::equity::{EquityCurve, MinuteObservation, PositionObservation};
use crate::error::EngineError;
use crate::fills::{simulate_minute, FillParams};
use crate::filters::FilterBank;
use crate::invariants::{InvariantEnforcer, InvariantMode};
use crate::market::{MarketRules, SymbolIdx, SymbolTable};
use crate::metrics::MetricsCollector;
use crate::orders::{Fill, Order, OrderOutcome, Side};
use crate::position::{Position, WalletState};
use crate::report::{fills_fingerprint, BacktestReport, CollateralSummary, Termination};
use crate::unstuck::{loss_allowance, unstuck_candidate};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Cooperative halt signal, checked between minutes.
pub type HaltFlag = Arc<AtomicBool>;

/// Per-side mutable state, arena-indexed by `SymbolIdx`.
struct SideState {
    side: Side,
    /// Side-level config (TWEL, allowance, filter spans).
    base: SideConfig,
    /// Per-symbol resolved configs (overrides applied).
    cfgs: Vec<SideConfig>,
    modes: Vec<ForcedMode>,
    emas: Vec<EmaTracker>,
    filters: FilterBank,
    positions: Vec<Position>,
    /// Current per-position exposure limit.
    wel: f64,
    eligible: Vec<bool>,
}

impl SideState {
    fn new(
        side: Side,
        config: &BotConfig,
        symbols: &SymbolTable,
        warmup_ratio: f64,
    ) -> Self {
        let n = symbols.len();
        let base = config.side(side).clone();
        let mut cfgs = Vec::with_capacity(n);
        let mut modes = Vec::with_capacity(n);
        let mut emas = Vec::with_capacity(n);
        for s in 0..n {
            let cfg = config.resolved_side(side, symbols.name(s));
            let spans = [cfg.ema_span_0, cfg.ema_span_1, cfg.ema_span_2()];
            let warmup = EmaTracker::warmup_bound(spans[0], spans[1], spans[2], warmup_ratio);
            emas.push(EmaTracker::new(spans, warmup));
            modes.push(config.resolved_forced_mode(side, symbols.name(s)));
            cfgs.push(cfg);
        }
        let filters = FilterBank::new(n, &base);
        let wel = if base.n_positions > 0 {
            base.total_wallet_exposure_limit / base.n_positions as f64
        } else {
            0.0
        };
        Self {
            side,
            base,
            cfgs,
            modes,
            emas,
            filters,
            positions: vec![Position::default(); n],
            wel,
            eligible: vec![true; n],
        }
    }

    #[inline]
    fn disabled(&self) -> bool {
        self.base.is_disabled()
    }

    fn held(&self) -> Vec<bool> {
        self.positions.iter().map(|p| p.is_open()).collect()
    }

    /// Effective operating mode for a symbol this minute: non-eligibility
    /// degrades Normal to graceful stop (closes only).
    fn effective_mode(&self, s: SymbolIdx) -> ForcedMode {
        let mode = self.modes[s];
        if mode == ForcedMode::Normal && !self.eligible[s] {
            ForcedMode::GracefulStop
        } else {
            mode
        }
    }
}

/// A stuck-position close candidate with its global selection key.
struct UnstuckPick {
    gap: f64,
    side_rank: u8,
    order: Order,
}

/// The backtest engine for one run.
pub struct Backtest<'a> {
    config: BotConfig,
    symbols: SymbolTable,
    grid: &'a CandleGrid,
    wallet: WalletState,
    long: SideState,
    short: SideState,
    /// Per-symbol bid/ask reference: previous minute's close.
    marks: Vec<f64>,
    collateral_idx: Option<SymbolIdx>,
    btc_collateral: f64,
    usd_debt: f64,
    halt: HaltFlag,
    enforcer: InvariantEnforcer,
    fill_params: FillParams,
    fills: Vec<Fill>,
    observations: Vec<MinuteObservation>,
    equity_curve: EquityCurve,
    metrics: MetricsCollector,
}

impl<'a> Backtest<'a> {
    pub fn new(
        config: BotConfig,
        symbols: &[String],
        market_map: &HashMap<String, MarketRules>,
        grid: &'a CandleGrid,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if grid.n_minutes() == 0 || grid.n_symbols() == 0 {
            return Err(EngineError::ConfigInvalid {
                field: "candles".into(),
                reason: "empty candle stream".into(),
            });
        }
        let table = SymbolTable::resolve(symbols, market_map)?;
        if table.len() != grid.n_symbols() {
            return Err(EngineError::ConfigInvalid {
                field: "symbols".into(),
                reason: format!(
                    "symbol count {} != grid width {}",
                    table.len(),
                    grid.n_symbols()
                ),
            });
        }

        let collateral_idx = match (&config.backtest.collateral_symbol, config.backtest.use_btc_collateral) {
            (Some(name), true) => Some(table.index_of(name).ok_or_else(|| {
                EngineError::ConfigInvalid {
                    field: "backtest.collateral_symbol".into(),
                    reason: format!("{} not in the candle stream", name),
                }
            })?),
            _ => None,
        };

        let warmup_ratio = config.backtest.warmup_ratio;
        let long = SideState::new(Side::Long, &config, &table, warmup_ratio);
        let short = SideState::new(Side::Short, &config, &table, warmup_ratio);
        let marks = (0..table.len()).map(|s| grid.candle(0, s).open).collect();
        let wallet = WalletState::new(config.backtest.starting_balance);
        let fill_params = FillParams {
            maker_fee_rate: config.backtest.maker_fee_rate,
            taker_fee_rate: config.backtest.taker_fee_rate,
            fee_multiplier: config.backtest.fee_multiplier,
        };
        let n_minutes = grid.n_minutes();
        let metrics = MetricsCollector::new(config.backtest.starting_balance);

        Ok(Self {
            config,
            symbols: table,
            grid,
            wallet,
            long,
            short,
            marks,
            collateral_idx,
            btc_collateral: 0.0,
            usd_debt: 0.0,
            halt: Arc::new(AtomicBool::new(false)),
            enforcer: InvariantEnforcer::new(InvariantMode::Soft),
            fill_params,
            fills: Vec::new(),
            observations: Vec::with_capacity(n_minutes),
            equity_curve: EquityCurve::with_capacity(n_minutes),
            metrics,
        })
    }

    /// Switch invariant enforcement mode (default: Soft).
    pub fn with_invariant_mode(mut self, mode: InvariantMode) -> Self {
        self.enforcer = InvariantEnforcer::new(mode);
        self
    }

    /// Handle for a cooperative "halt after this minute" signal.
    pub fn halt_flag(&self) -> HaltFlag {
        self.halt.clone()
    }

    /// Run the full stream (or until bankruptcy/halt) and produce the report.
    pub fn run(mut self) -> Result<BacktestReport, EngineError> {
        let n_minutes = self.grid.n_minutes();
        let n_symbols = self.symbols.len();
        let bankruptcy_threshold =
            self.config.backtest.liquidation_buffer * self.config.backtest.starting_balance;
        info!(
            n_symbols,
            n_minutes,
            starting_balance = self.config.backtest.starting_balance,
            "starting backtest"
        );

        let mut termination = Termination::Completed;

        for m in 0..n_minutes {
            let ts = self.grid.ts(m);
            let candles = self.grid.minute(m);

            // Phase 2: indicator updates.
            for side in [&mut self.long, &mut self.short] {
                for s in 0..n_symbols {
                    side.emas[s].update(candles[s].close);
                }
                side.filters.update_minute(m as u64, candles);
            }

            // Phase 3: eligibility and dynamic exposure.
            for side in [&mut self.long, &mut self.short] {
                if side.disabled() {
                    continue;
                }
                let eligibility = side.filters.select_eligible(&side.held());
                side.wel = eligibility
                    .wallet_exposure_limit(side.base.total_wallet_exposure_limit);
                side.eligible = eligibility.eligible;
            }

            // Phase 4: trailing extrema from this candle.
            for side in [&mut self.long, &mut self.short] {
                for s in 0..n_symbols {
                    if side.positions[s].is_open() {
                        side.positions[s].trailing.update(&candles[s]);
                    }
                }
            }

            // Phase 5: order generation.
            let mut orders: Vec<Order> = Vec::new();
            let mut best_unstuck: Option<UnstuckPick> = None;
            for side in [&self.long, &self.short] {
                generate_side_orders(
                    side,
                    &self.symbols,
                    &self.marks,
                    &self.wallet,
                    &mut orders,
                    &mut best_unstuck,
                );
            }
            if let Some(pick) = best_unstuck {
                orders.push(pick.order);
            }
            for order in &orders {
                self.enforcer
                    .check_order(ts, order, self.symbols.rules(order.symbol))?;
            }

            // Phase 6: fills. Snapshot open timestamps first so episode
            // durations survive the mutation.
            let open_since_long: Vec<Option<MinuteStamp>> = self
                .long
                .positions
                .iter()
                .map(|p| p.is_open().then_some(p.since_ts))
                .collect();
            let open_since_short: Vec<Option<MinuteStamp>> = self
                .short
                .positions
                .iter()
                .map(|p| p.is_open().then_some(p.since_ts))
                .collect();
            let fills_start = self.fills.len();
            let n_fills = simulate_minute(
                ts,
                &orders,
                &self.marks,
                candles,
                self.symbols.rules_slice(),
                &mut self.long.positions,
                &mut self.short.positions,
                &mut self.wallet,
                &self.fill_params,
                &mut self.fills,
            );
            if n_fills > 0 {
                debug!(ts, n_fills, "minute fills applied");
            }

            // Phase 7: commit; collateral conversion; bankruptcy check.
            let btc_close = self.collateral_idx.map(|ci| candles[ci].close);
            for fill in &self.fills[fills_start..] {
                self.metrics.on_fill(
                    fill,
                    self.wallet.balance,
                    self.symbols.rules(fill.symbol).c_mult,
                );
                if let Some(btc) = btc_close {
                    if fill.realized_pnl > 0.0 {
                        self.btc_collateral += fill.realized_pnl / btc;
                    } else if fill.realized_pnl < 0.0 {
                        self.usd_debt += -fill.realized_pnl;
                    }
                }
                // A close fill that flattened the position ends an episode.
                let kind = fill.order_kind();
                if kind.is_close() && fill.new_size == 0.0 {
                    let since = match kind.side() {
                        Side::Long => open_since_long[fill.symbol],
                        Side::Short => open_since_short[fill.symbol],
                    };
                    if let Some(opened) = since {
                        self.metrics.on_episode_closed(ts.saturating_sub(opened));
                    }
                }
            }

            let equity = self.current_equity(candles);
            self.enforcer
                .check_finite(ts, "equity", &[equity, self.wallet.balance])?;

            if equity <= bankruptcy_threshold {
                info!(ts, equity, "bankruptcy: halting run");
                termination = Termination::Bankruptcy { ts };
                self.record_minute(ts, equity, btc_close);
                break;
            }

            // Phase 8: record and verify.
            self.record_minute(ts, equity, btc_close);
            self.enforcer.check_minute(
                ts,
                &self.wallet,
                &self.long.positions,
                &self.short.positions,
                self.symbols.rules_slice(),
                self.long.base.total_wallet_exposure_limit,
                self.short.base.total_wallet_exposure_limit,
                self.long.base.enforce_exposure_limit,
                self.short.base.enforce_exposure_limit,
            )?;

            for s in 0..n_symbols {
                self.marks[s] = candles[s].close;
            }

            if self.halt.load(Ordering::Relaxed) && m + 1 < n_minutes {
                info!(ts, "halt signal observed");
                termination = Termination::Halted { ts };
                break;
            }
        }

        self.finish(termination)
    }

    fn current_equity(&self, candles: &[crate::candles::Candle]) -> f64 {
        let mut equity = self.wallet.balance;
        for s in 0..self.symbols.len() {
            let rules = self.symbols.rules(s);
            equity += self.long.positions[s].unrealized_pnl(Side::Long, candles[s].close, rules);
            equity +=
                self.short.positions[s].unrealized_pnl(Side::Short, candles[s].close, rules);
        }
        equity
    }

    fn record_minute(&mut self, ts: MinuteStamp, equity: f64, btc_close: Option<f64>) {
        let mut positions = Vec::new();
        for side in [&self.long, &self.short] {
            for s in 0..self.symbols.len() {
                let pos = &side.positions[s];
                if pos.is_open() {
                    positions.push(PositionObservation {
                        symbol: s,
                        side: side.side,
                        size: pos.size,
                        price: pos.price,
                        wallet_exposure: pos
                            .wallet_exposure(self.wallet.balance, self.symbols.rules(s)),
                    });
                }
            }
        }
        self.observations.push(MinuteObservation {
            ts,
            balance: self.wallet.balance,
            equity,
            equity_btc: btc_close.map(|btc| equity / btc),
            positions,
        });
        self.equity_curve.record(ts, self.wallet.balance, equity);
        self.metrics.on_minute(ts, equity);
    }

    fn finish(mut self, termination: Termination) -> Result<BacktestReport, EngineError> {
        let end_ts = self
            .equity_curve
            .last()
            .map(|p| p.ts)
            .unwrap_or(self.grid.start_ts());

        // Episodes still open at the end count up to the last minute.
        for side in [&self.long, &self.short] {
            for pos in &side.positions {
                if pos.is_open() {
                    self.metrics
                        .on_episode_closed(end_ts.saturating_sub(pos.since_ts));
                }
            }
        }

        let final_equity = self
            .equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.wallet.balance);
        // Treat timestamps as epoch-minutes for period formatting only when
        // they plausibly are (synthetic streams index from zero).
        let epoch_minutes = self.grid.start_ts() >= 10_000_000;
        let metrics = self
            .metrics
            .finalize(self.wallet.total_fees_paid, epoch_minutes);

        let collateral = self.collateral_idx.map(|_| CollateralSummary {
            btc_collateral: self.btc_collateral,
            usd_debt: self.usd_debt,
            final_equity_btc: self
                .observations
                .last()
                .and_then(|o| o.equity_btc)
                .unwrap_or(0.0),
        });

        info!(
            final_balance = self.wallet.balance,
            final_equity,
            n_fills = self.fills.len(),
            "backtest finished"
        );

        Ok(BacktestReport {
            termination,
            starting_balance: self.config.backtest.starting_balance,
            final_balance: self.wallet.balance,
            final_equity,
            fills_fingerprint: fills_fingerprint(&self.fills),
            fills: self.fills,
            observations: self.observations,
            equity_curve: self.equity_curve,
            metrics,
            invariant_counters: *self.enforcer.counters(),
            collateral,
        })
    }
}

/// Generate the order set for one side this minute, and fold its stuck
/// positions into the global unstuck selection.
fn generate_side_orders(
    side: &SideState,
    symbols: &SymbolTable,
    marks: &[f64],
    wallet: &WalletState,
    orders: &mut Vec<Order>,
    best_unstuck: &mut Option<UnstuckPick>,
) {
    let allowance = loss_allowance(
        wallet,
        side.base.unstuck_loss_allowance_pct,
        side.base.total_wallet_exposure_limit,
    );

    for s in 0..symbols.len() {
        let mode = side.effective_mode(s);
        if mode == ForcedMode::Manual {
            continue;
        }
        let pos = &side.positions[s];
        let ctx = OrderContext {
            side: side.side,
            symbol: s,
            cfg: &side.cfgs[s],
            rules: symbols.rules(s),
            balance: wallet.balance,
            wel: side.wel,
            mark: marks[s],
            bands: side.emas[s].bands(),
            grid_log_range: side.filters.grid_log_range(s),
            pos,
        };

        if mode == ForcedMode::Panic {
            if let Some(order) = panic_close(&ctx) {
                orders.push(order);
            }
            continue;
        }

        orders.extend(next_closes(&ctx));

        if mode == ForcedMode::Normal && !side.disabled() {
            if let OrderOutcome::Emit(order) = next_entry(&ctx) {
                orders.push(order);
            }
        }

        // Unstuck closes run under normal operation and graceful stop;
        // take-profit-only mode excludes them.
        if matches!(mode, ForcedMode::Normal | ForcedMode::GracefulStop) {
            if let Some(candidate) = unstuck_candidate(&ctx, allowance) {
                let side_rank = if side.side == Side::Long { 0 } else { 1 };
                let better = match best_unstuck {
                    None => true,
                    Some(current) => {
                        (candidate.gap, side_rank, s)
                            < (current.gap, current.side_rank, current.order.symbol)
                    }
                };
                if better {
                    *best_unstuck = Some(UnstuckPick {
                        gap: candidate.gap,
                        side_rank,
                        order: candidate.order,
                    });
                }
            }
        }
    }
}

/// Run many independent configs over the same data in parallel. Each run owns
/// its state; results come back in input order.
pub fn run_many(
    configs: Vec<BotConfig>,
    symbols: &[String],
    market_map: &HashMap<String, MarketRules>,
    grid: &CandleGrid,
) -> Vec<Result<BacktestReport, EngineError>> {
    configs
        .into_par_iter()
        .map(|config| Backtest::new(config, symbols, market_map, grid)?.run())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{generate, SyntheticConfig};

    fn quick_config() -> BotConfig {
        let mut config = BotConfig::default();
        config.long.ema_span_0 = 30.0;
        config.long.ema_span_1 = 60.0;
        config.long.n_positions = 2;
        config.long.total_wallet_exposure_limit = 1.0;
        config.long.entry_initial_qty_pct = 0.05;
        config
    }

    #[test]
    fn test_engine_runs_and_reports() {
        let market = generate(&SyntheticConfig {
            n_minutes: 2000,
            volatility: 0.003,
            ..Default::default()
        });
        let backtest = Backtest::new(
            quick_config(),
            &market.symbols,
            &market.market_map,
            &market.grid,
        )
        .unwrap();
        let report = backtest.run().unwrap();
        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(report.observations.len(), 2000);
        assert_eq!(report.equity_curve.len(), 2000);
        assert!(report.final_balance > 0.0);
        // Soft invariants should stay clean on a healthy run.
        assert_eq!(report.invariant_counters.total(), 0);
    }

    #[test]
    fn test_determinism_identical_fingerprints() {
        let market = generate(&SyntheticConfig {
            n_minutes: 3000,
            volatility: 0.004,
            ..Default::default()
        });
        let run = || {
            Backtest::new(
                quick_config(),
                &market.symbols,
                &market.market_map,
                &market.grid,
            )
            .unwrap()
            .run()
            .unwrap()
        };
        let a = run();
        let b = run();
        assert_eq!(a.fills_fingerprint, b.fills_fingerprint);
        assert_eq!(a.equity_curve.rolling_hash(), b.equity_curve.rolling_hash());
        assert_eq!(a.fills.len(), b.fills.len());
    }

    #[test]
    fn test_halt_flag_stops_run() {
        let market = generate(&SyntheticConfig {
            n_minutes: 1000,
            ..Default::default()
        });
        let backtest = Backtest::new(
            quick_config(),
            &market.symbols,
            &market.market_map,
            &market.grid,
        )
        .unwrap();
        backtest.halt_flag().store(true, Ordering::Relaxed);
        let report = backtest.run().unwrap();
        assert!(matches!(report.termination, Termination::Halted { .. }));
        assert_eq!(report.observations.len(), 1);
    }

    #[test]
    fn test_manual_mode_emits_nothing() {
        let mut config = quick_config();
        config.forced_mode_long = ForcedMode::Manual;
        config.forced_mode_short = ForcedMode::Manual;
        let market = generate(&SyntheticConfig {
            n_minutes: 2000,
            volatility: 0.005,
            ..Default::default()
        });
        let report = Backtest::new(config, &market.symbols, &market.market_map, &market.grid)
            .unwrap()
            .run()
            .unwrap();
        assert!(report.fills.is_empty());
        assert_eq!(report.final_balance, report.starting_balance);
    }

    #[test]
    fn test_run_many_matches_single_runs() {
        let market = generate(&SyntheticConfig {
            n_minutes: 1500,
            volatility: 0.003,
            ..Default::default()
        });
        let single = Backtest::new(
            quick_config(),
            &market.symbols,
            &market.market_map,
            &market.grid,
        )
        .unwrap()
        .run()
        .unwrap();
        let many = run_many(
            vec![quick_config(), quick_config()],
            &market.symbols,
            &market.market_map,
            &market.grid,
        );
        for result in many {
            let report = result.unwrap();
            assert_eq!(report.fills_fingerprint, single.fills_fingerprint);
        }
    }

    #[test]
    fn test_btc_collateral_accounting() {
        let mut config = quick_config();
        config.backtest.use_btc_collateral = true;
        config.backtest.collateral_symbol = Some("COIN0USDT".into());
        let market = generate(&SyntheticConfig {
            n_minutes: 3000,
            volatility: 0.004,
            ..Default::default()
        });
        let report = Backtest::new(config, &market.symbols, &market.market_map, &market.grid)
            .unwrap()
            .run()
            .unwrap();
        let collateral = report.collateral.unwrap();
        // Conservation: every realized pnl landed in exactly one bucket.
        let pos_pnl: f64 = report
            .fills
            .iter()
            .filter(|f| f.realized_pnl > 0.0)
            .map(|f| f.realized_pnl)
            .sum();
        let neg_pnl: f64 = report
            .fills
            .iter()
            .filter(|f| f.realized_pnl < 0.0)
            .map(|f| -f.realized_pnl)
            .sum();
        assert!((collateral.usd_debt - neg_pnl).abs() < 1e-9);
        if pos_pnl > 0.0 {
            assert!(collateral.btc_collateral > 0.0);
        }
        // Observations carry the BTC-denominated equity.
        assert!(report.observations[0].equity_btc.is_some());
    }
}

//! Strategy & Backtest Configuration
//!
//! Frozen, fully-typed configuration. An external loader (out of scope here)
//! deserializes these records; `validate()` is the single gate between raw
//! numbers and the engine. Per-symbol overrides are resolved eagerly at init
//! into one `SideConfig` per (symbol, side); no dynamic lookup at runtime.

use crate::error::EngineError;
use crate::orders::Side;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Live operating mode forced on one side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForcedMode {
    /// Normal operation.
    #[default]
    #[serde(rename = "n")]
    Normal,
    /// Manual: the engine emits nothing for this side.
    #[serde(rename = "m")]
    Manual,
    /// Graceful stop: close orders only, no new entries.
    #[serde(rename = "gs")]
    GracefulStop,
    /// Take-profit only: close orders only, unstuck excluded.
    #[serde(rename = "t")]
    TakeProfitOnly,
    /// Panic: market-close the entire position.
    #[serde(rename = "p")]
    Panic,
}

impl ForcedMode {
    /// True when no new entries are permitted under this mode.
    #[inline]
    pub fn entries_disabled(&self) -> bool {
        !matches!(self, ForcedMode::Normal)
    }
}

/// Per-side strategy parameters. One instance for longs, one for shorts;
/// threshold/distance parameters are expressed in the long convention and
/// mirrored internally by the order math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideConfig {
    // EMA bands
    /// First EMA span, minutes.
    pub ema_span_0: f64,
    /// Second EMA span, minutes. The third span is `sqrt(span_0 * span_1)`.
    pub ema_span_1: f64,

    // Initial entry
    /// Distance of the initial entry below the lower band (long).
    pub entry_initial_ema_dist: f64,
    /// Initial entry cost as a fraction of `balance * WEL`.
    pub entry_initial_qty_pct: f64,

    // Grid re-entries
    /// Base spacing between grid levels, fraction of position price.
    pub entry_grid_spacing_pct: f64,
    /// Spacing multiplier weight on `WE / WEL`.
    pub entry_grid_spacing_we_weight: f64,
    /// Spacing multiplier weight on the hourly log-range EMA.
    pub entry_grid_spacing_log_weight: f64,
    /// Grid double-down factor applied to current position size.
    pub entry_grid_double_down_factor: f64,

    // Trailing entries
    pub entry_trailing_threshold_pct: f64,
    pub entry_trailing_retracement_pct: f64,
    pub entry_trailing_double_down_factor: f64,
    /// Blend between trailing and grid entries: 0 = grid only, ±1 = trailing
    /// only, positive = trailing first, negative = grid first.
    pub entry_trailing_grid_ratio: f64,

    // Grid closes
    pub close_grid_markup_start: f64,
    pub close_grid_markup_end: f64,
    /// Fraction of `full_psize` closed per TP level.
    pub close_grid_qty_pct: f64,

    // Trailing closes
    pub close_trailing_threshold_pct: f64,
    pub close_trailing_retracement_pct: f64,
    /// Fraction of `full_psize` closed per trailing close.
    pub close_trailing_qty_pct: f64,
    pub close_trailing_grid_ratio: f64,

    // Unstuck
    /// Position is stuck when `WE / WEL` exceeds this and no profitable TP is
    /// reachable.
    pub unstuck_threshold: f64,
    /// Distance of the unstuck close above the upper band (long).
    pub unstuck_ema_dist: f64,
    /// Fraction of `full_psize` per unstuck close, before allowance capping.
    pub unstuck_close_pct: f64,
    /// Loss allowance budget as a fraction of peak balance, scaled by TWEL.
    pub unstuck_loss_allowance_pct: f64,

    // Forager filters
    /// Fraction of symbols dropped from the bottom of the volume ranking.
    pub filter_volume_drop_pct: f64,
    /// Span of the quote-volume EMA, minutes.
    pub filter_volume_ema_span: f64,
    /// Span of the log-range EMA used for ranking, minutes.
    pub filter_log_range_ema_span: f64,
    /// Span of the grid-spacing log-range EMA, hours.
    pub grid_log_range_ema_span_hours: f64,

    // Exposure
    /// Maximum number of concurrent positions on this side.
    pub n_positions: usize,
    /// Total wallet exposure limit for the side (TWEL).
    pub total_wallet_exposure_limit: f64,
    /// Enforce the per-position limit with auto-reduce closes.
    pub enforce_exposure_limit: bool,
}

impl Default for SideConfig {
    fn default() -> Self {
        Self {
            ema_span_0: 720.0,
            ema_span_1: 2160.0,
            entry_initial_ema_dist: 0.0,
            entry_initial_qty_pct: 0.01,
            entry_grid_spacing_pct: 0.03,
            entry_grid_spacing_we_weight: 1.0,
            entry_grid_spacing_log_weight: 0.0,
            entry_grid_double_down_factor: 1.0,
            entry_trailing_threshold_pct: 0.0,
            entry_trailing_retracement_pct: 0.0,
            entry_trailing_double_down_factor: 1.0,
            entry_trailing_grid_ratio: 0.0,
            close_grid_markup_start: 0.01,
            close_grid_markup_end: 0.02,
            close_grid_qty_pct: 0.25,
            close_trailing_threshold_pct: 0.0,
            close_trailing_retracement_pct: 0.0,
            close_trailing_qty_pct: 1.0,
            close_trailing_grid_ratio: 0.0,
            unstuck_threshold: 0.9,
            unstuck_ema_dist: 0.0,
            unstuck_close_pct: 0.05,
            unstuck_loss_allowance_pct: 0.01,
            filter_volume_drop_pct: 0.0,
            filter_volume_ema_span: 1440.0,
            filter_log_range_ema_span: 1440.0,
            grid_log_range_ema_span_hours: 24.0,
            n_positions: 1,
            total_wallet_exposure_limit: 1.0,
            enforce_exposure_limit: true,
        }
    }
}

impl SideConfig {
    /// Validate ranges. `side` only labels the error.
    pub fn validate(&self, side: Side) -> Result<(), EngineError> {
        let label = match side {
            Side::Long => "long",
            Side::Short => "short",
        };
        let err = |field: &str, reason: String| EngineError::ConfigInvalid {
            field: format!("{}.{}", label, field),
            reason,
        };

        let positive = [
            ("ema_span_0", self.ema_span_0),
            ("ema_span_1", self.ema_span_1),
            ("filter_volume_ema_span", self.filter_volume_ema_span),
            ("filter_log_range_ema_span", self.filter_log_range_ema_span),
            ("grid_log_range_ema_span_hours", self.grid_log_range_ema_span_hours),
        ];
        for (name, v) in positive {
            if !v.is_finite() || v < 1.0 {
                return Err(err(name, format!("must be >= 1, got {}", v)));
            }
        }

        let non_negative = [
            ("entry_initial_qty_pct", self.entry_initial_qty_pct),
            ("entry_grid_spacing_pct", self.entry_grid_spacing_pct),
            ("entry_grid_double_down_factor", self.entry_grid_double_down_factor),
            ("entry_trailing_double_down_factor", self.entry_trailing_double_down_factor),
            ("close_grid_qty_pct", self.close_grid_qty_pct),
            ("close_trailing_qty_pct", self.close_trailing_qty_pct),
            ("unstuck_threshold", self.unstuck_threshold),
            ("unstuck_close_pct", self.unstuck_close_pct),
            ("unstuck_loss_allowance_pct", self.unstuck_loss_allowance_pct),
            ("total_wallet_exposure_limit", self.total_wallet_exposure_limit),
        ];
        for (name, v) in non_negative {
            if !v.is_finite() || v < 0.0 {
                return Err(err(name, format!("must be >= 0, got {}", v)));
            }
        }

        if self.entry_initial_qty_pct <= 0.0 {
            return Err(err("entry_initial_qty_pct", "must be > 0".into()));
        }
        if self.close_grid_qty_pct <= 0.0 {
            return Err(err("close_grid_qty_pct", "must be > 0".into()));
        }
        if self.close_grid_markup_start == 0.0 && self.close_grid_markup_end == 0.0 {
            return Err(err(
                "close_grid_markup_start",
                "markup_start and markup_end cannot both be zero".into(),
            ));
        }
        for (name, v) in [
            ("entry_trailing_grid_ratio", self.entry_trailing_grid_ratio),
            ("close_trailing_grid_ratio", self.close_trailing_grid_ratio),
        ] {
            if !v.is_finite() || !(-1.0..=1.0).contains(&v) {
                return Err(err(name, format!("must be in [-1, 1], got {}", v)));
            }
        }
        if !(0.0..=1.0).contains(&self.filter_volume_drop_pct) {
            return Err(err(
                "filter_volume_drop_pct",
                format!("must be in [0, 1], got {}", self.filter_volume_drop_pct),
            ));
        }
        if self.n_positions == 0 && self.total_wallet_exposure_limit > 0.0 {
            return Err(err(
                "n_positions",
                "must be > 0 when the side has exposure".into(),
            ));
        }
        Ok(())
    }

    /// Third EMA span: geometric mean of the configured pair.
    #[inline]
    pub fn ema_span_2(&self) -> f64 {
        (self.ema_span_0 * self.ema_span_1).sqrt()
    }

    /// True when the side can never open a position.
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.total_wallet_exposure_limit <= 0.0 || self.n_positions == 0
    }
}

/// Backtest-level parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestParams {
    pub starting_balance: f64,
    /// Maker fee rate on limit fills.
    pub maker_fee_rate: f64,
    /// Taker fee rate on market-kind fills.
    pub taker_fee_rate: f64,
    /// Stress-test multiplier applied to both fee rates.
    pub fee_multiplier: f64,
    /// Run halts when `equity <= liquidation_buffer * starting_balance`.
    /// Zero reduces to the plain bankruptcy rule.
    pub liquidation_buffer: f64,
    /// EMA warm-up bound as a fraction of the largest span.
    pub warmup_ratio: f64,
    /// Convert positive realized PnL to BTC collateral.
    pub use_btc_collateral: bool,
    /// Symbol whose close prices denominate BTC collateral. Required when
    /// `use_btc_collateral` is set.
    pub collateral_symbol: Option<String>,
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            starting_balance: 10_000.0,
            maker_fee_rate: 0.0002,
            taker_fee_rate: 0.0005,
            fee_multiplier: 1.0,
            liquidation_buffer: 0.0,
            warmup_ratio: 1.0,
            use_btc_collateral: false,
            collateral_symbol: None,
        }
    }
}

impl BacktestParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.starting_balance.is_finite() || self.starting_balance <= 0.0 {
            return Err(EngineError::ConfigInvalid {
                field: "backtest.starting_balance".into(),
                reason: format!("must be > 0, got {}", self.starting_balance),
            });
        }
        for (name, v) in [
            ("maker_fee_rate", self.maker_fee_rate),
            ("taker_fee_rate", self.taker_fee_rate),
            ("fee_multiplier", self.fee_multiplier),
            ("liquidation_buffer", self.liquidation_buffer),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(EngineError::ConfigInvalid {
                    field: format!("backtest.{}", name),
                    reason: format!("must be >= 0, got {}", v),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.liquidation_buffer) {
            return Err(EngineError::ConfigInvalid {
                field: "backtest.liquidation_buffer".into(),
                reason: "must be in [0, 1]".into(),
            });
        }
        if !self.warmup_ratio.is_finite() || self.warmup_ratio <= 0.0 {
            return Err(EngineError::ConfigInvalid {
                field: "backtest.warmup_ratio".into(),
                reason: "must be > 0".into(),
            });
        }
        if self.use_btc_collateral && self.collateral_symbol.is_none() {
            return Err(EngineError::ConfigInvalid {
                field: "backtest.collateral_symbol".into(),
                reason: "required when use_btc_collateral is set".into(),
            });
        }
        Ok(())
    }
}

/// Partial per-symbol override of a `SideConfig`. Unset fields inherit from
/// the side default. Resolved once at init.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideConfigPatch {
    pub ema_span_0: Option<f64>,
    pub ema_span_1: Option<f64>,
    pub entry_initial_ema_dist: Option<f64>,
    pub entry_initial_qty_pct: Option<f64>,
    pub entry_grid_spacing_pct: Option<f64>,
    pub entry_grid_spacing_we_weight: Option<f64>,
    pub entry_grid_spacing_log_weight: Option<f64>,
    pub entry_grid_double_down_factor: Option<f64>,
    pub entry_trailing_threshold_pct: Option<f64>,
    pub entry_trailing_retracement_pct: Option<f64>,
    pub entry_trailing_double_down_factor: Option<f64>,
    pub entry_trailing_grid_ratio: Option<f64>,
    pub close_grid_markup_start: Option<f64>,
    pub close_grid_markup_end: Option<f64>,
    pub close_grid_qty_pct: Option<f64>,
    pub close_trailing_threshold_pct: Option<f64>,
    pub close_trailing_retracement_pct: Option<f64>,
    pub close_trailing_qty_pct: Option<f64>,
    pub close_trailing_grid_ratio: Option<f64>,
    pub unstuck_threshold: Option<f64>,
    pub unstuck_ema_dist: Option<f64>,
    pub unstuck_close_pct: Option<f64>,
    pub unstuck_loss_allowance_pct: Option<f64>,
}

impl SideConfigPatch {
    /// Apply this patch on top of `base`.
    pub fn apply(&self, base: &SideConfig) -> SideConfig {
        let mut cfg = base.clone();
        macro_rules! patch {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { cfg.$field = v; })*
            };
        }
        patch!(
            ema_span_0,
            ema_span_1,
            entry_initial_ema_dist,
            entry_initial_qty_pct,
            entry_grid_spacing_pct,
            entry_grid_spacing_we_weight,
            entry_grid_spacing_log_weight,
            entry_grid_double_down_factor,
            entry_trailing_threshold_pct,
            entry_trailing_retracement_pct,
            entry_trailing_double_down_factor,
            entry_trailing_grid_ratio,
            close_grid_markup_start,
            close_grid_markup_end,
            close_grid_qty_pct,
            close_trailing_threshold_pct,
            close_trailing_retracement_pct,
            close_trailing_qty_pct,
            close_trailing_grid_ratio,
            unstuck_threshold,
            unstuck_ema_dist,
            unstuck_close_pct,
            unstuck_loss_allowance_pct,
        );
        cfg
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Per-symbol override record: optional patch per side, optional forced-mode
/// override per side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolOverride {
    pub long: SideConfigPatch,
    pub short: SideConfigPatch,
    pub forced_mode_long: Option<ForcedMode>,
    pub forced_mode_short: Option<ForcedMode>,
}

/// Complete frozen configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub long: SideConfig,
    pub short: SideConfig,
    pub forced_mode_long: ForcedMode,
    pub forced_mode_short: ForcedMode,
    pub backtest: BacktestParams,
    /// Per-symbol overrides, keyed by symbol name.
    #[serde(default)]
    pub overrides: HashMap<String, SymbolOverride>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            long: SideConfig::default(),
            short: SideConfig {
                total_wallet_exposure_limit: 0.0,
                ..SideConfig::default()
            },
            forced_mode_long: ForcedMode::Normal,
            forced_mode_short: ForcedMode::Normal,
            backtest: BacktestParams::default(),
            overrides: HashMap::new(),
        }
    }
}

impl BotConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.long.validate(Side::Long)?;
        self.short.validate(Side::Short)?;
        self.backtest.validate()?;
        for (symbol, ov) in &self.overrides {
            ov.long.apply(&self.long).validate(Side::Long).map_err(|e| {
                EngineError::ConfigInvalid {
                    field: format!("overrides[{}]", symbol),
                    reason: e.to_string(),
                }
            })?;
            ov.short
                .apply(&self.short)
                .validate(Side::Short)
                .map_err(|e| EngineError::ConfigInvalid {
                    field: format!("overrides[{}]", symbol),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn side(&self, side: Side) -> &SideConfig {
        match side {
            Side::Long => &self.long,
            Side::Short => &self.short,
        }
    }

    pub fn forced_mode(&self, side: Side) -> ForcedMode {
        match side {
            Side::Long => self.forced_mode_long,
            Side::Short => self.forced_mode_short,
        }
    }

    /// Resolve the effective per-symbol config for one side, applying any
    /// override patch.
    pub fn resolved_side(&self, side: Side, symbol: &str) -> SideConfig {
        let base = self.side(side);
        match self.overrides.get(symbol) {
            Some(ov) => match side {
                Side::Long => ov.long.apply(base),
                Side::Short => ov.short.apply(base),
            },
            None => base.clone(),
        }
    }

    /// Effective forced mode for `(side, symbol)`.
    pub fn resolved_forced_mode(&self, side: Side, symbol: &str) -> ForcedMode {
        let default = self.forced_mode(side);
        match self.overrides.get(symbol) {
            Some(ov) => match side {
                Side::Long => ov.forced_mode_long.unwrap_or(default),
                Side::Short => ov.forced_mode_short.unwrap_or(default),
            },
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        BotConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_markups_rejected() {
        let mut cfg = BotConfig::default();
        cfg.long.close_grid_markup_start = 0.0;
        cfg.long.close_grid_markup_end = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_ratio_out_of_range_rejected() {
        let mut cfg = BotConfig::default();
        cfg.long.entry_trailing_grid_ratio = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_collateral_symbol_required() {
        let mut cfg = BotConfig::default();
        cfg.backtest.use_btc_collateral = true;
        assert!(cfg.validate().is_err());
        cfg.backtest.collateral_symbol = Some("BTCUSDT".into());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_override_resolution() {
        let mut cfg = BotConfig::default();
        cfg.overrides.insert(
            "ETHUSDT".into(),
            SymbolOverride {
                long: SideConfigPatch {
                    entry_grid_spacing_pct: Some(0.07),
                    ..Default::default()
                },
                forced_mode_long: Some(ForcedMode::GracefulStop),
                ..Default::default()
            },
        );

        let eth = cfg.resolved_side(Side::Long, "ETHUSDT");
        assert!((eth.entry_grid_spacing_pct - 0.07).abs() < 1e-12);
        // Unpatched fields inherit.
        assert_eq!(eth.ema_span_0, cfg.long.ema_span_0);
        // Other symbols untouched.
        let btc = cfg.resolved_side(Side::Long, "BTCUSDT");
        assert_eq!(btc, cfg.long);

        assert_eq!(
            cfg.resolved_forced_mode(Side::Long, "ETHUSDT"),
            ForcedMode::GracefulStop
        );
        assert_eq!(
            cfg.resolved_forced_mode(Side::Short, "ETHUSDT"),
            ForcedMode::Normal
        );
    }

    #[test]
    fn test_ema_span_2_geometric_mean() {
        let cfg = SideConfig {
            ema_span_0: 100.0,
            ema_span_1: 400.0,
            ..Default::default()
        };
        assert!((cfg.ema_span_2() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_forced_mode_serde_codes() {
        let json = serde_json::to_string(&ForcedMode::GracefulStop).unwrap();
        assert_eq!(json, "\"gs\"");
        let mode: ForcedMode = serde_json::from_str("\"p\"").unwrap();
        assert_eq!(mode, ForcedMode::Panic);
    }
}

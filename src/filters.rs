//! Volatility/Volume Filters & Eligibility (Forager)
//!
//! Per-symbol rolling statistics driving dynamic symbol selection:
//!
//! - a quote-volume EMA (minutes) used to drop illiquid symbols,
//! - a log-range EMA (minutes) used to rank survivors by volatility,
//! - a separate hourly log-range EMA feeding grid-spacing modulation.
//!
//! Each minute the eligible set is the top `n_positions` of the ranking,
//! union any symbols currently holding a position on this side (held symbols
//! stay sticky so they can keep closing). The per-position exposure limit is
//! `TWEL / effective_n_positions` and rebalances as the set changes.

use crate::candles::Candle;
use crate::config::SideConfig;
use crate::market::SymbolIdx;
use serde::{Deserialize, Serialize};

/// Single bias-corrected EMA (same correction scheme as `EmaTracker`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarEma {
    alpha: f64,
    value: f64,
    decay_pow: f64,
}

impl ScalarEma {
    pub fn new(span: f64) -> Self {
        Self {
            alpha: 2.0 / (span.max(1.0) + 1.0),
            value: 0.0,
            decay_pow: 1.0,
        }
    }

    #[inline]
    pub fn update(&mut self, x: f64) {
        self.value = self.value * (1.0 - self.alpha) + x * self.alpha;
        self.decay_pow *= 1.0 - self.alpha;
    }

    /// Bias-corrected value; 0 before the first update.
    #[inline]
    pub fn get(&self) -> f64 {
        let w = 1.0 - self.decay_pow;
        if w > 0.0 {
            self.value / w
        } else {
            0.0
        }
    }
}

/// Outcome of one eligibility pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    /// Bitset over `SymbolIdx`: may this symbol open new entries?
    pub eligible: Vec<bool>,
    /// `max(1, |eligible|)`; divides TWEL into per-position limits.
    pub effective_n_positions: usize,
}

impl Eligibility {
    /// Per-position wallet exposure limit for the side.
    #[inline]
    pub fn wallet_exposure_limit(&self, total_wallet_exposure_limit: f64) -> f64 {
        total_wallet_exposure_limit / self.effective_n_positions as f64
    }
}

/// Per-symbol filter state for one side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterBank {
    volume_ema: Vec<ScalarEma>,
    log_range_ema: Vec<ScalarEma>,
    hourly_log_range_ema: Vec<ScalarEma>,
    /// Running high/low of the hour in progress.
    hour_high: Vec<f64>,
    hour_low: Vec<f64>,
    volume_drop_pct: f64,
    n_positions: usize,
}

impl FilterBank {
    pub fn new(n_symbols: usize, cfg: &SideConfig) -> Self {
        Self {
            volume_ema: vec![ScalarEma::new(cfg.filter_volume_ema_span); n_symbols],
            log_range_ema: vec![ScalarEma::new(cfg.filter_log_range_ema_span); n_symbols],
            hourly_log_range_ema: vec![
                ScalarEma::new(cfg.grid_log_range_ema_span_hours);
                n_symbols
            ],
            hour_high: vec![0.0; n_symbols],
            hour_low: vec![f64::INFINITY; n_symbols],
            volume_drop_pct: cfg.filter_volume_drop_pct,
            n_positions: cfg.n_positions,
        }
    }

    /// Fold in one minute of candles (symbol-index order). `minute_idx` is the
    /// row index from stream start; the hourly EMA commits on each completed
    /// hour boundary.
    pub fn update_minute(&mut self, minute_idx: u64, candles: &[Candle]) {
        for (s, candle) in candles.iter().enumerate() {
            self.volume_ema[s].update(candle.volume);
            self.log_range_ema[s].update(candle.log_range());
            self.hour_high[s] = self.hour_high[s].max(candle.high);
            self.hour_low[s] = self.hour_low[s].min(candle.low);
        }
        if (minute_idx + 1) % 60 == 0 {
            for s in 0..self.hour_high.len() {
                if self.hour_low[s] > 0.0 && self.hour_low[s].is_finite() {
                    let hourly = (self.hour_high[s] / self.hour_low[s]).ln();
                    self.hourly_log_range_ema[s].update(hourly);
                }
                self.hour_high[s] = 0.0;
                self.hour_low[s] = f64::INFINITY;
            }
        }
    }

    /// Hourly log-range EMA for grid-spacing modulation. Zero until the first
    /// completed hour.
    #[inline]
    pub fn grid_log_range(&self, s: SymbolIdx) -> f64 {
        self.hourly_log_range_ema[s].get()
    }

    #[inline]
    pub fn volume(&self, s: SymbolIdx) -> f64 {
        self.volume_ema[s].get()
    }

    #[inline]
    pub fn log_range(&self, s: SymbolIdx) -> f64 {
        self.log_range_ema[s].get()
    }

    /// Select the eligible set: drop the bottom `volume_drop_pct` by volume
    /// EMA, rank survivors by log-range EMA descending, take the top
    /// `n_positions`, then union in currently-held symbols. Ties break on
    /// symbol index so iteration stays deterministic.
    pub fn select_eligible(&self, held: &[bool]) -> Eligibility {
        let n = self.volume_ema.len();
        let mut eligible = vec![false; n];

        // Volume ranking, ascending: the first `drop_count` are dropped.
        let mut by_volume: Vec<SymbolIdx> = (0..n).collect();
        by_volume.sort_by(|&a, &b| {
            self.volume(a)
                .partial_cmp(&self.volume(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let drop_count = (n as f64 * self.volume_drop_pct).floor() as usize;
        let mut survivor = vec![true; n];
        for &s in by_volume.iter().take(drop_count) {
            survivor[s] = false;
        }

        // Volatility ranking, descending.
        let mut by_range: Vec<SymbolIdx> = (0..n).filter(|&s| survivor[s]).collect();
        by_range.sort_by(|&a, &b| {
            self.log_range(b)
                .partial_cmp(&self.log_range(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        for &s in by_range.iter().take(self.n_positions) {
            eligible[s] = true;
        }

        // Held symbols stay in the set.
        for (s, &is_held) in held.iter().enumerate() {
            if is_held {
                eligible[s] = true;
            }
        }

        let count = eligible.iter().filter(|&&e| e).count();
        Eligibility {
            eligible,
            effective_n_positions: count.max(1),
        }
    }
}

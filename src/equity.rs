//! Equity Curve & Minute Observations
//!
//! Append-only per-minute recording: the balance/equity curve with running
//! peak and drawdown, and the per-symbol position snapshot the analysis layer
//! consumes. A rolling hash over the recorded points (and over the fill
//! stream, maintained by the report layer) makes determinism checks cheap:
//! two runs agree iff their hashes agree.

use crate::candles::MinuteStamp;
use crate::market::SymbolIdx;
use crate::orders::Side;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// One point on the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: MinuteStamp,
    pub balance: f64,
    pub equity: f64,
    /// Drawdown from peak equity, as a fraction of the peak.
    pub drawdown_pct: f64,
}

/// Snapshot of one open position inside a minute observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionObservation {
    pub symbol: SymbolIdx,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub wallet_exposure: f64,
}

/// Per-minute observation: wallet state plus all open positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteObservation {
    pub ts: MinuteStamp,
    pub balance: f64,
    pub equity: f64,
    /// Equity denominated in BTC when collateral mode is on.
    pub equity_btc: Option<f64>,
    pub positions: Vec<PositionObservation>,
}

/// Time-indexed equity curve with running peak/drawdown and a rolling hash.
///
/// Invariant: points are strictly increasing by `ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityCurve {
    points: Vec<EquityPoint>,
    peak_equity: f64,
    max_drawdown_pct: f64,
    rolling_hash: u64,
}

impl Default for EquityCurve {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl EquityCurve {
    const HASH_SEED: u64 = 0xEC_5E_ED;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            peak_equity: 0.0,
            max_drawdown_pct: 0.0,
            rolling_hash: Self::HASH_SEED,
        }
    }

    /// Record one minute. `ts` must be strictly greater than the last point's.
    pub fn record(&mut self, ts: MinuteStamp, balance: f64, equity: f64) {
        if let Some(last) = self.points.last() {
            debug_assert!(ts > last.ts, "equity curve ts must be strictly increasing");
        }
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown_pct = if self.peak_equity > 0.0 {
            (self.peak_equity - equity) / self.peak_equity
        } else {
            0.0
        };
        if drawdown_pct > self.max_drawdown_pct {
            self.max_drawdown_pct = drawdown_pct;
        }

        let point = EquityPoint {
            ts,
            balance,
            equity,
            drawdown_pct,
        };
        let mut hasher = DefaultHasher::new();
        self.rolling_hash.hash(&mut hasher);
        point.ts.hash(&mut hasher);
        point.balance.to_bits().hash(&mut hasher);
        point.equity.to_bits().hash(&mut hasher);
        self.rolling_hash = hasher.finish();

        self.points.push(point);
    }

    #[inline]
    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }

    /// Worst drawdown seen so far, as a fraction of peak.
    #[inline]
    pub fn max_drawdown_pct(&self) -> f64 {
        self.max_drawdown_pct
    }

    #[inline]
    pub fn rolling_hash(&self) -> u64 {
        self.rolling_hash
    }

    pub fn first(&self) -> Option<&EquityPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&EquityPoint> {
        self.points.last()
    }
}

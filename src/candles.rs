//! Candle Stream Model
//!
//! One-minute OHLCV candles, grouped per minute across symbols and stored
//! minute-major in a dense grid (arena layout: symbol lookups are index
//! arithmetic, iteration order is deterministic).
//!
//! Validation happens once at construction; the engine never re-checks candle
//! sanity inside the hot loop.

use crate::error::EngineError;
use crate::market::SymbolIdx;
use serde::{Deserialize, Serialize};

/// Minute index since stream start. The engine clock.
pub type MinuteStamp = u64;

/// A single 1-minute OHLCV candle. `volume` is quote volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Natural log of the high/low range. Dimensionless volatility proxy.
    #[inline]
    pub fn log_range(&self) -> f64 {
        if self.low > 0.0 && self.high >= self.low {
            (self.high / self.low).ln()
        } else {
            0.0
        }
    }

    fn validate(&self) -> Result<(), String> {
        if !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite())
        {
            return Err("non-finite field".into());
        }
        if self.low > self.high {
            return Err("low > high".into());
        }
        if self.volume < 0.0 {
            return Err("negative volume".into());
        }
        if self.low <= 0.0 {
            return Err("non-positive price".into());
        }
        Ok(())
    }
}

/// Dense minute-major candle grid: every symbol has a candle for every minute.
///
/// Input streams are expected pre-aligned (the data layer is an external
/// collaborator); construction validates ordering and candle sanity and is the
/// single entry point for market data into the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleGrid {
    n_symbols: usize,
    n_minutes: usize,
    /// First minute's timestamp (minute index in the caller's epoch).
    start_ts: MinuteStamp,
    /// Minute-major: `data[minute * n_symbols + symbol]`.
    data: Vec<Candle>,
}

impl CandleGrid {
    /// Build a grid from per-symbol series. All series must have equal length;
    /// `series[s][m]` is symbol `s` at minute `start_ts + m`.
    pub fn from_series(
        start_ts: MinuteStamp,
        symbol_names: &[String],
        series: &[Vec<Candle>],
    ) -> Result<Self, EngineError> {
        let n_symbols = series.len();
        let n_minutes = series.first().map(|s| s.len()).unwrap_or(0);

        for (s, sym_series) in series.iter().enumerate() {
            let name = symbol_names.get(s).cloned().unwrap_or_else(|| format!("#{}", s));
            if sym_series.len() != n_minutes {
                return Err(EngineError::CandleMalformed {
                    ts: start_ts,
                    symbol: name,
                    reason: format!(
                        "series length {} != expected {}",
                        sym_series.len(),
                        n_minutes
                    ),
                });
            }
            for (m, candle) in sym_series.iter().enumerate() {
                if let Err(reason) = candle.validate() {
                    return Err(EngineError::CandleMalformed {
                        ts: start_ts + m as MinuteStamp,
                        symbol: name,
                        reason,
                    });
                }
            }
        }

        let mut data = Vec::with_capacity(n_minutes * n_symbols);
        for m in 0..n_minutes {
            for sym_series in series {
                data.push(sym_series[m]);
            }
        }

        Ok(Self {
            n_symbols,
            n_minutes,
            start_ts,
            data,
        })
    }

    #[inline]
    pub fn n_symbols(&self) -> usize {
        self.n_symbols
    }

    #[inline]
    pub fn n_minutes(&self) -> usize {
        self.n_minutes
    }

    #[inline]
    pub fn start_ts(&self) -> MinuteStamp {
        self.start_ts
    }

    /// Timestamp of minute row `m`.
    #[inline]
    pub fn ts(&self, m: usize) -> MinuteStamp {
        self.start_ts + m as MinuteStamp
    }

    /// Candle for `(minute row, symbol)`.
    #[inline]
    pub fn candle(&self, m: usize, s: SymbolIdx) -> &Candle {
        &self.data[m * self.n_symbols + s]
    }

    /// All candles for minute row `m`, in symbol-index order.
    #[inline]
    pub fn minute(&self, m: usize) -> &[Candle] {
        &self.data[m * self.n_symbols..(m + 1) * self.n_symbols]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(o: f64, h: f64, l: f64, c: f64, v: f64) -> Candle {
        Candle {
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn test_grid_layout() {
        let grid = CandleGrid::from_series(
            100,
            &["A".into(), "B".into()],
            &[
                vec![candle(1.0, 2.0, 0.5, 1.5, 10.0), candle(1.5, 3.0, 1.0, 2.0, 20.0)],
                vec![candle(9.0, 9.5, 8.5, 9.0, 5.0), candle(9.0, 10.0, 9.0, 9.8, 6.0)],
            ],
        )
        .unwrap();

        assert_eq!(grid.n_symbols(), 2);
        assert_eq!(grid.n_minutes(), 2);
        assert_eq!(grid.ts(1), 101);
        assert_eq!(grid.candle(0, 1).open, 9.0);
        assert_eq!(grid.candle(1, 0).close, 2.0);
        assert_eq!(grid.minute(1).len(), 2);
    }

    #[test]
    fn test_rejects_inverted_candle() {
        let err = CandleGrid::from_series(
            0,
            &["A".into()],
            &[vec![candle(1.0, 0.9, 1.1, 1.0, 1.0)]],
        )
        .unwrap_err();
        match err {
            EngineError::CandleMalformed { symbol, reason, .. } => {
                assert_eq!(symbol, "A");
                assert!(reason.contains("low > high"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejects_ragged_series() {
        let err = CandleGrid::from_series(
            0,
            &["A".into(), "B".into()],
            &[
                vec![candle(1.0, 2.0, 0.5, 1.5, 1.0)],
                vec![],
            ],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::CandleMalformed { .. }));
    }

    #[test]
    fn test_log_range() {
        let c = candle(100.0, 110.0, 100.0, 105.0, 1.0);
        assert!((c.log_range() - (1.1f64).ln()).abs() < 1e-12);
    }
}

//! Engine Error Taxonomy
//!
//! Fatal conditions surface as `EngineError`; recoverable per-order conditions
//! (min-cost rejections, trigger-not-met) are `SkipReason` values on the order
//! stream and never become errors.

use serde::{Deserialize, Serialize};

/// Fatal errors for a backtest run.
///
/// Recovery is never attempted locally: the driver halts and reports the
/// offending context upward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    /// Out-of-range or inconsistent configuration, detected at init.
    ConfigInvalid {
        field: String,
        reason: String,
    },
    /// No market rules registered for a symbol present in the candle stream.
    MarketMissing {
        symbol: String,
    },
    /// Candle failed validation (`low > high`, negative volume, out-of-order
    /// timestamp). Carries the offending coordinates.
    CandleMalformed {
        ts: u64,
        symbol: String,
        reason: String,
    },
    /// NaN or infinity detected in engine state.
    NumericallyDegenerate {
        ts: u64,
        context: String,
    },
    /// A hard-mode invariant check failed at a minute boundary.
    InvariantViolated {
        ts: u64,
        detail: String,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigInvalid { field, reason } => {
                write!(f, "invalid config: {} ({})", field, reason)
            }
            Self::MarketMissing { symbol } => {
                write!(f, "no market rules for symbol {}", symbol)
            }
            Self::CandleMalformed { ts, symbol, reason } => {
                write!(f, "malformed candle at minute {} for {}: {}", ts, symbol, reason)
            }
            Self::NumericallyDegenerate { ts, context } => {
                write!(f, "non-finite state at minute {}: {}", ts, context)
            }
            Self::InvariantViolated { ts, detail } => {
                write!(f, "invariant violated at minute {}: {}", ts, detail)
            }
        }
    }
}

impl std::error::Error for EngineError {}

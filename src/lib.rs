//! perpgrid: deterministic backtesting engine for a contrarian
//! grid-plus-trailing market-making strategy on perpetual futures.
//!
//! Given a multi-symbol stream of 1-minute OHLCV candles, per-side strategy
//! configuration, and exchange market rules, the engine produces the complete
//! resting-order set each minute, simulates fills against the candle, and
//! emits fill events, minute observations, and aggregate performance metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Backtest (engine)                        │
//! │   (owns all state, drives the 8-phase minute loop, enforces     │
//! │    determinism, bankruptcy, and the cooperative halt signal)    │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//!   ┌────────────┐       ┌────────────┐         ┌────────────┐
//!   │ CandleGrid │       │ EMA bands  │         │ FilterBank │
//!   │ (minute-   │       │ + trailing │         │ (forager   │
//!   │  major)    │       │  extrema   │         │  ranking)  │
//!   └────────────┘       └────────────┘         └────────────┘
//!                               │
//!                               ▼
//!           ┌───────────────────────────────────────┐
//!           │    Order math (pure, per symbol/side) │
//!           │  entries · closes · unstuck scheduler │
//!           └───────────────────┬───────────────────┘
//!                               ▼
//!                      ┌─────────────────┐
//!                      │  Fill simulator │
//!                      │ (candle ranges) │
//!                      └────────┬────────┘
//!                               ▼
//!              ┌──────────────────────────────┐
//!              │ WalletState · EquityCurve ·  │
//!              │ MetricsCollector · Report    │
//!              └──────────────────────────────┘
//! ```
//!
//! # Determinism guarantees
//!
//! - No wall clock, no I/O: the minute index is the only clock.
//! - Arena layout: every per-symbol iteration runs in `SymbolIdx` order.
//! - Fill application order is fixed: auto-reduce → unstuck → closes
//!   (closest to mark first) → entries.
//! - Rolling-hash fingerprints over the fill stream and equity curve make
//!   cross-run comparison cheap: same inputs, same hashes.
//!
//! The engine has no network I/O, UI, config-file parsing, exchange API, or
//! optimizer; those are external collaborators.

pub mod candles;
pub mod closes;
pub mod config;
pub mod ema;
pub mod engine;
pub mod entries;
pub mod equity;
pub mod error;
pub mod fills;
pub mod filters;
pub mod invariants;
pub mod market;
pub mod metrics;
pub mod orders;
pub mod position;
pub mod report;
pub mod rounding;
pub mod synthetic;
pub mod trailing;
pub mod unstuck;

#[cfg(test)]
mod scenario_tests;

// Re-exports for convenience
pub use candles::{Candle, CandleGrid, MinuteStamp};
pub use closes::{auto_reduce, close_grid, close_trailing, full_psize, next_closes, panic_close};
pub use config::{
    BacktestParams, BotConfig, ForcedMode, SideConfig, SideConfigPatch, SymbolOverride,
};
pub use ema::{EmaBands, EmaTracker};
pub use engine::{run_many, Backtest, HaltFlag};
pub use entries::{grid_reentry, initial_entry, next_entry, trailing_entry, OrderContext};
pub use equity::{EquityCurve, EquityPoint, MinuteObservation, PositionObservation};
pub use error::EngineError;
pub use fills::{execution_price, simulate_minute, FillParams};
pub use filters::{Eligibility, FilterBank, ScalarEma};
pub use invariants::{InvariantCounters, InvariantEnforcer, InvariantMode};
pub use market::{MarketRules, SymbolIdx, SymbolTable};
pub use metrics::{MetricsCollector, MetricsReport};
pub use orders::{Fill, Order, OrderKind, OrderOutcome, Side, SkipReason};
pub use position::{realized_pnl, Position, WalletState, BALANCE_FLOOR};
pub use report::{
    fills_fingerprint, write_fills_jsonl, BacktestReport, CollateralSummary, Termination,
};
pub use synthetic::{generate, SyntheticConfig, SyntheticMarket};
pub use trailing::TrailingState;
pub use unstuck::{is_stuck, loss_allowance, unstuck_candidate, UnstuckCandidate};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let tracker = EmaTracker::new([10.0, 20.0, 14.1], 1);
        assert_eq!(tracker.count(), 0);
        assert_eq!(OrderKind::COUNT, 24);
    }
}

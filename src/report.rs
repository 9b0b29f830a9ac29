//! Run Report
//!
//! The complete output artifact of one backtest: the fill stream, minute
//! observations, equity curve, final metrics, and a determinism fingerprint
//! over the fills. Optionally exports fills as JSON lines; no persisted
//! format is required by the engine itself.

use crate::candles::MinuteStamp;
use crate::equity::{EquityCurve, MinuteObservation};
use crate::invariants::InvariantCounters;
use crate::market::SymbolTable;
use crate::metrics::MetricsReport;
use crate::orders::Fill;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Ran through the whole candle stream.
    Completed,
    /// Equity fell through the bankruptcy/liquidation threshold.
    Bankruptcy { ts: MinuteStamp },
    /// Cooperative halt signal observed between minutes.
    Halted { ts: MinuteStamp },
}

/// BTC collateral accounting summary (collateral mode only).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollateralSummary {
    /// Accumulated BTC bought with positive realized PnL.
    pub btc_collateral: f64,
    /// Accumulated USD debt from negative realized PnL.
    pub usd_debt: f64,
    /// Final equity denominated in BTC.
    pub final_equity_btc: f64,
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub termination: Termination,
    pub starting_balance: f64,
    pub final_balance: f64,
    pub final_equity: f64,
    pub fills: Vec<Fill>,
    pub observations: Vec<MinuteObservation>,
    pub equity_curve: EquityCurve,
    pub metrics: MetricsReport,
    pub invariant_counters: InvariantCounters,
    /// Rolling hash over the fill stream; equal hashes mean byte-identical
    /// fill sequences.
    pub fills_fingerprint: u64,
    pub collateral: Option<CollateralSummary>,
}

/// Rolling hash over a fill sequence. Field-by-field over bit patterns, so
/// any numeric divergence changes the fingerprint.
pub fn fills_fingerprint(fills: &[Fill]) -> u64 {
    let mut hash: u64 = 0xF1_11_5EED;
    for fill in fills {
        let mut hasher = DefaultHasher::new();
        hash.hash(&mut hasher);
        fill.ts.hash(&mut hasher);
        fill.symbol.hash(&mut hasher);
        fill.kind.hash(&mut hasher);
        fill.price.to_bits().hash(&mut hasher);
        fill.qty.to_bits().hash(&mut hasher);
        fill.fee.to_bits().hash(&mut hasher);
        fill.realized_pnl.to_bits().hash(&mut hasher);
        fill.new_size.to_bits().hash(&mut hasher);
        fill.new_price.to_bits().hash(&mut hasher);
        hash = hasher.finish();
    }
    hash
}

/// One exported fill row with the symbol name resolved.
#[derive(Debug, Clone, Serialize)]
struct FillRow<'a> {
    ts: MinuteStamp,
    symbol: &'a str,
    kind: u8,
    price: f64,
    qty: f64,
    fee: f64,
    realized_pnl: f64,
    new_size: f64,
    new_price: f64,
}

/// Write fills as JSON lines.
pub fn write_fills_jsonl<W: Write>(
    mut writer: W,
    fills: &[Fill],
    symbols: &SymbolTable,
) -> std::io::Result<()> {
    for fill in fills {
        let row = FillRow {
            ts: fill.ts,
            symbol: symbols.name(fill.symbol),
            kind: fill.kind,
            price: fill.price,
            qty: fill.qty,
            fee: fill.fee,
            realized_pnl: fill.realized_pnl,
            new_size: fill.new_size,
            new_price: fill.new_price,
        };
        serde_json::to_writer(&mut writer, &row)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

//! Market Rules Registry
//!
//! Per-symbol exchange constants, resolved once at init into a dense arena
//! indexed by `SymbolIdx`. Immutable for the duration of a run.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dense symbol index into the engine's per-symbol arenas.
pub type SymbolIdx = usize;

/// Exchange trading rules for one perpetual contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketRules {
    /// Price quantization step.
    pub price_step: f64,
    /// Quantity quantization step.
    pub qty_step: f64,
    /// Minimum order quantity.
    pub min_qty: f64,
    /// Minimum order notional (`qty * price * c_mult`).
    pub min_cost: f64,
    /// Contract multiplier.
    pub c_mult: f64,
}

impl MarketRules {
    fn validate(&self, symbol: &str) -> Result<(), EngineError> {
        let fields = [
            ("price_step", self.price_step),
            ("qty_step", self.qty_step),
            ("c_mult", self.c_mult),
        ];
        for (name, v) in fields {
            if !v.is_finite() || v <= 0.0 {
                return Err(EngineError::ConfigInvalid {
                    field: format!("market[{}].{}", symbol, name),
                    reason: format!("must be finite and > 0, got {}", v),
                });
            }
        }
        if !self.min_qty.is_finite() || self.min_qty < 0.0 {
            return Err(EngineError::ConfigInvalid {
                field: format!("market[{}].min_qty", symbol),
                reason: "must be finite and >= 0".into(),
            });
        }
        if !self.min_cost.is_finite() || self.min_cost < 0.0 {
            return Err(EngineError::ConfigInvalid {
                field: format!("market[{}].min_cost", symbol),
                reason: "must be finite and >= 0".into(),
            });
        }
        Ok(())
    }
}

/// Symbol name table plus per-symbol rules, in dense index order.
///
/// The index order is the insertion order of `symbols`, and every iteration in
/// the engine follows it, which keeps runs deterministic without sorting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTable {
    names: Vec<String>,
    rules: Vec<MarketRules>,
}

impl SymbolTable {
    /// Resolve `symbols` against a market map. Every symbol in the stream must
    /// have rules; a missing entry is fatal at init.
    pub fn resolve(
        symbols: &[String],
        market_map: &HashMap<String, MarketRules>,
    ) -> Result<Self, EngineError> {
        let mut names = Vec::with_capacity(symbols.len());
        let mut rules = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let r = market_map
                .get(symbol)
                .ok_or_else(|| EngineError::MarketMissing {
                    symbol: symbol.clone(),
                })?;
            r.validate(symbol)?;
            names.push(symbol.clone());
            rules.push(*r);
        }
        Ok(Self { names, rules })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[inline]
    pub fn name(&self, idx: SymbolIdx) -> &str {
        &self.names[idx]
    }

    #[inline]
    pub fn rules(&self, idx: SymbolIdx) -> &MarketRules {
        &self.rules[idx]
    }

    /// All rules in symbol-index order.
    #[inline]
    pub fn rules_slice(&self) -> &[MarketRules] {
        &self.rules
    }

    pub fn index_of(&self, symbol: &str) -> Option<SymbolIdx> {
        self.names.iter().position(|n| n == symbol)
    }
}

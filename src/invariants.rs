//! Invariant Enforcement
//!
//! Engine-level invariants checked at every minute boundary and on every
//! emitted order. Soft mode logs and counts violations; Hard mode turns the
//! first violation into a fatal error. Numeric degeneracy (NaN/infinity) is
//! always fatal regardless of mode.

use crate::candles::MinuteStamp;
use crate::error::EngineError;
use crate::market::MarketRules;
use crate::orders::Order;
use crate::position::{Position, WalletState, BALANCE_FLOOR};
use crate::rounding::is_step_multiple;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InvariantMode {
    /// No checking (not recommended outside benchmarks).
    Off,
    /// Log + count violations, continue.
    #[default]
    Soft,
    /// First violation aborts the run.
    Hard,
}

/// Violation counters, reported with the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InvariantCounters {
    pub balance_floor: u64,
    pub position_price_mismatch: u64,
    pub exposure_exceeded: u64,
    pub cumsum_regression: u64,
    pub malformed_order: u64,
}

impl InvariantCounters {
    pub fn total(&self) -> u64 {
        self.balance_floor
            + self.position_price_mismatch
            + self.exposure_exceeded
            + self.cumsum_regression
            + self.malformed_order
    }
}

#[derive(Debug, Clone)]
pub struct InvariantEnforcer {
    mode: InvariantMode,
    counters: InvariantCounters,
}

impl InvariantEnforcer {
    pub fn new(mode: InvariantMode) -> Self {
        Self {
            mode,
            counters: InvariantCounters::default(),
        }
    }

    pub fn counters(&self) -> &InvariantCounters {
        &self.counters
    }

    fn violation(
        &mut self,
        ts: MinuteStamp,
        counter: impl FnOnce(&mut InvariantCounters) -> &mut u64,
        detail: String,
    ) -> Result<(), EngineError> {
        if self.mode == InvariantMode::Off {
            return Ok(());
        }
        *counter(&mut self.counters) += 1;
        match self.mode {
            InvariantMode::Hard => Err(EngineError::InvariantViolated { ts, detail }),
            _ => {
                warn!(ts, %detail, "invariant violation");
                Ok(())
            }
        }
    }

    /// NaN/infinity guard; fatal in every mode.
    pub fn check_finite(
        &self,
        ts: MinuteStamp,
        context: &str,
        values: &[f64],
    ) -> Result<(), EngineError> {
        for v in values {
            if !v.is_finite() {
                return Err(EngineError::NumericallyDegenerate {
                    ts,
                    context: context.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Minute-boundary wallet and position invariants.
    pub fn check_minute(
        &mut self,
        ts: MinuteStamp,
        wallet: &WalletState,
        positions_long: &[Position],
        positions_short: &[Position],
        rules: &[MarketRules],
        twel_long: f64,
        twel_short: f64,
        enforce_long: bool,
        enforce_short: bool,
    ) -> Result<(), EngineError> {
        self.check_finite(
            ts,
            "wallet",
            &[wallet.balance, wallet.pnl_cumsum_running, wallet.pnl_cumsum_max],
        )?;

        if wallet.balance < BALANCE_FLOOR {
            self.violation(
                ts,
                |c| &mut c.balance_floor,
                format!("balance {} below floor", wallet.balance),
            )?;
        }
        if wallet.pnl_cumsum_max < wallet.pnl_cumsum_running - 1e-9 {
            self.violation(
                ts,
                |c| &mut c.cumsum_regression,
                format!(
                    "pnl cumsum max {} < running {}",
                    wallet.pnl_cumsum_max, wallet.pnl_cumsum_running
                ),
            )?;
        }

        for (label, positions, twel, enforce) in [
            ("long", positions_long, twel_long, enforce_long),
            ("short", positions_short, twel_short, enforce_short),
        ] {
            let mut we_sum = 0.0;
            for (s, pos) in positions.iter().enumerate() {
                self.check_finite(ts, "position", &[pos.size, pos.price])?;
                let size_zero = pos.size == 0.0;
                let price_zero = pos.price == 0.0;
                if size_zero != price_zero {
                    self.violation(
                        ts,
                        |c| &mut c.position_price_mismatch,
                        format!(
                            "{} position {}: size {} / price {}",
                            label, s, pos.size, pos.price
                        ),
                    )?;
                }
                we_sum += pos.wallet_exposure(wallet.balance, &rules[s]);
            }
            // Tolerance: 1% when enforced, looser rounding slack otherwise.
            let tolerance = if enforce { 1.01 } else { 1.10 };
            if twel > 0.0 && we_sum > twel * tolerance {
                self.violation(
                    ts,
                    |c| &mut c.exposure_exceeded,
                    format!("{} exposure sum {} exceeds TWEL {}", label, we_sum, twel),
                )?;
            }
        }
        Ok(())
    }

    /// Every emitted order must respect exchange quantization and minimums.
    pub fn check_order(
        &mut self,
        ts: MinuteStamp,
        order: &Order,
        rules: &MarketRules,
    ) -> Result<(), EngineError> {
        self.check_finite(ts, "order", &[order.price, order.qty])?;
        let mut problems = Vec::new();
        if order.qty < rules.min_qty - 1e-12 {
            problems.push("qty below min_qty");
        }
        if order.qty * order.price * rules.c_mult < rules.min_cost - 1e-9 {
            problems.push("notional below min_cost");
        }
        if !order.kind.is_market() && !is_step_multiple(order.price, rules.price_step) {
            problems.push("price off step grid");
        }
        if !is_step_multiple(order.qty, rules.qty_step) {
            problems.push("qty off step grid");
        }
        if !problems.is_empty() {
            self.violation(
                ts,
                |c| &mut c.malformed_order,
                format!("order {:?}: {}", order.kind, problems.join(", ")),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::OrderKind;

    fn rules() -> MarketRules {
        MarketRules {
            price_step: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            min_cost: 1.0,
            c_mult: 1.0,
        }
    }

    #[test]
    fn test_hard_mode_aborts_on_mismatch() {
        let mut enforcer = InvariantEnforcer::new(InvariantMode::Hard);
        let wallet = WalletState::new(1000.0);
        let mut bad = Position::default();
        bad.price = 100.0; // size 0 but price set
        let result = enforcer.check_minute(
            5,
            &wallet,
            &[bad],
            &[Position::default()],
            &[rules()],
            1.0,
            1.0,
            true,
            true,
        );
        assert!(matches!(
            result,
            Err(EngineError::InvariantViolated { ts: 5, .. })
        ));
    }

    #[test]
    fn test_soft_mode_counts_and_continues() {
        let mut enforcer = InvariantEnforcer::new(InvariantMode::Soft);
        let wallet = WalletState::new(1000.0);
        let mut bad = Position::default();
        bad.price = 100.0;
        enforcer
            .check_minute(
                5,
                &wallet,
                &[bad],
                &[Position::default()],
                &[rules()],
                1.0,
                1.0,
                true,
                true,
            )
            .unwrap();
        assert_eq!(enforcer.counters().position_price_mismatch, 1);
    }

    #[test]
    fn test_nan_always_fatal() {
        let enforcer = InvariantEnforcer::new(InvariantMode::Off);
        let result = enforcer.check_finite(3, "test", &[1.0, f64::NAN]);
        assert!(matches!(
            result,
            Err(EngineError::NumericallyDegenerate { ts: 3, .. })
        ));
    }

    #[test]
    fn test_order_quantization_checks() {
        let mut enforcer = InvariantEnforcer::new(InvariantMode::Hard);
        let good = Order {
            symbol: 0,
            kind: OrderKind::EntryGridNormalLong,
            price: 100.05,
            qty: 0.05,
        };
        enforcer.check_order(0, &good, &rules()).unwrap();

        let off_grid = Order {
            price: 100.057,
            ..good
        };
        assert!(enforcer.check_order(0, &off_grid, &rules()).is_err());

        let below_cost = Order {
            price: 100.05,
            qty: 0.001,
            ..good
        };
        assert!(enforcer.check_order(0, &below_cost, &rules()).is_err());
    }

    #[test]
    fn test_exposure_sum_tolerance() {
        let mut enforcer = InvariantEnforcer::new(InvariantMode::Hard);
        let wallet = WalletState::new(1000.0);
        let mut pos = Position::default();
        pos.merge_entry(10.2, 100.0, 0, 0.001); // WE = 1.02 > 1.01 tolerance
        let result = enforcer.check_minute(
            0,
            &wallet,
            &[pos],
            &[Position::default()],
            &[rules()],
            1.0,
            1.0,
            true,
            true,
        );
        assert!(result.is_err());
        // Unenforced sides get rounding slack instead.
        let mut relaxed = InvariantEnforcer::new(InvariantMode::Hard);
        let result = relaxed.check_minute(
            0,
            &wallet,
            &[pos],
            &[Position::default()],
            &[rules()],
            1.0,
            1.0,
            false,
            true,
        );
        assert!(result.is_ok());
    }
}

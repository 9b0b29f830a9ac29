//! Positions & Wallet State
//!
//! A `Position` is one (symbol, side) exposure: size is stored as a positive
//! magnitude on both sides (the side is the arena the position lives in), the
//! average price full-precision after merging. The trailing tracker is a field
//! of the position so resets are tied to the position's lifetime.
//!
//! `WalletState` is the single owner of balance and realized-PnL accounting;
//! order-math helpers borrow it read-only.

use crate::candles::MinuteStamp;
use crate::market::MarketRules;
use crate::orders::Side;
use crate::rounding::round_to_step;
use crate::trailing::TrailingState;
use serde::{Deserialize, Serialize};

/// Balance floor. Keeps exposure divisions defined after catastrophic loss.
pub const BALANCE_FLOOR: f64 = 1e-12;

/// One (symbol, side) position. Invariant: `size == 0.0 <=> price == 0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Positive magnitude, multiple of `qty_step`.
    pub size: f64,
    /// Average entry price, full precision.
    pub price: f64,
    /// Minute the position was opened.
    pub since_ts: MinuteStamp,
    /// Trailing extrema; reset on every size change.
    pub trailing: TrailingState,
}

impl Position {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.size > 0.0
    }

    /// Merge an entry fill of `qty` at `price` into the position.
    /// Size is re-quantized to the qty step; price is the size-weighted
    /// average kept at full precision.
    pub fn merge_entry(&mut self, qty: f64, price: f64, ts: MinuteStamp, qty_step: f64) {
        let new_size = round_to_step(self.size + qty, qty_step);
        if new_size <= 0.0 {
            self.close_full();
            return;
        }
        if !self.is_open() {
            self.since_ts = ts;
            self.price = price;
        } else {
            self.price =
                self.price * (self.size / new_size) + price * (qty / new_size);
        }
        self.size = new_size;
    }

    /// Reduce the position by a close fill of `qty`. Returns true when the
    /// position went flat.
    pub fn reduce(&mut self, qty: f64, qty_step: f64) -> bool {
        let new_size = round_to_step(self.size - qty, qty_step);
        if new_size <= qty_step * 0.5 {
            self.close_full();
            true
        } else {
            self.size = new_size;
            false
        }
    }

    fn close_full(&mut self) {
        self.size = 0.0;
        self.price = 0.0;
        self.since_ts = 0;
        self.trailing = TrailingState::default();
    }

    /// Wallet exposure: `size * price * c_mult / balance`.
    #[inline]
    pub fn wallet_exposure(&self, balance: f64, rules: &MarketRules) -> f64 {
        if !self.is_open() {
            return 0.0;
        }
        self.size * self.price * rules.c_mult / balance.max(BALANCE_FLOOR)
    }

    /// Unrealized PnL at `mark`.
    #[inline]
    pub fn unrealized_pnl(&self, side: Side, mark: f64, rules: &MarketRules) -> f64 {
        if !self.is_open() {
            return 0.0;
        }
        match side {
            Side::Long => self.size * rules.c_mult * (mark - self.price),
            Side::Short => self.size * rules.c_mult * (self.price - mark),
        }
    }
}

/// Realized PnL of a close fill of `qty` at `price` against entry `pprice`.
#[inline]
pub fn realized_pnl(side: Side, qty: f64, price: f64, pprice: f64, c_mult: f64) -> f64 {
    match side {
        Side::Long => qty.abs() * c_mult * (price - pprice),
        Side::Short => qty.abs() * c_mult * (pprice - price),
    }
}

/// Global wallet accounting, owned by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletState {
    pub balance: f64,
    /// Cumulative realized PnL since the run started (fees excluded).
    pub pnl_cumsum_running: f64,
    /// Running maximum of `pnl_cumsum_running`.
    pub pnl_cumsum_max: f64,
    /// Total fees paid since the run started.
    pub total_fees_paid: f64,
}

impl WalletState {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            balance: starting_balance,
            pnl_cumsum_running: 0.0,
            pnl_cumsum_max: 0.0,
            total_fees_paid: 0.0,
        }
    }

    /// Apply one fill's cash effects: realized PnL in, fee out.
    pub fn apply_fill(&mut self, pnl: f64, fee: f64) {
        self.balance = (self.balance + pnl - fee).max(BALANCE_FLOOR);
        self.pnl_cumsum_running += pnl;
        if self.pnl_cumsum_running > self.pnl_cumsum_max {
            self.pnl_cumsum_max = self.pnl_cumsum_running;
        }
        self.total_fees_paid += fee;
    }

    /// Balance at the realized-PnL peak:
    /// `balance + (pnl_cumsum_max - pnl_cumsum_running)`.
    #[inline]
    pub fn peak_balance(&self) -> f64 {
        self.balance + (self.pnl_cumsum_max - self.pnl_cumsum_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_merge_entry_averaging() {
        let mut pos = Position::default();
        pos.merge_entry(1.0, 100.0, 10, 0.001);
        assert_eq!(pos.size, 1.0);
        assert_eq!(pos.price, 100.0);
        assert_eq!(pos.since_ts, 10);

        // 1 @ 100 + 1 @ 90 -> 2 @ 95
        pos.merge_entry(1.0, 90.0, 20, 0.001);
        assert!((pos.size - 2.0).abs() < 1e-9);
        assert!((pos.price - 95.0).abs() < 1e-9);
        // Open timestamp is the first entry's.
        assert_eq!(pos.since_ts, 10);
    }

    #[test]
    fn test_reduce_to_flat_restores_invariant() {
        let mut pos = Position::default();
        pos.merge_entry(0.5, 100.0, 0, 0.001);
        let flat = pos.reduce(0.5, 0.001);
        assert!(flat);
        assert_eq!(pos.size, 0.0);
        assert_eq!(pos.price, 0.0);
    }

    #[test]
    fn test_partial_reduce() {
        let mut pos = Position::default();
        pos.merge_entry(1.0, 100.0, 0, 0.001);
        let flat = pos.reduce(0.4, 0.001);
        assert!(!flat);
        assert!((pos.size - 0.6).abs() < 1e-9);
        assert_eq!(pos.price, 100.0);
    }

    #[test]
    fn test_wallet_exposure() {
        let mut pos = Position::default();
        pos.merge_entry(2.0, 50.0, 0, 0.001);
        // 2 * 50 * 1 / 1000 = 0.1
        assert!((pos.wallet_exposure(1000.0, &rules()) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_pnl_sign_conventions() {
        // Long profits when price rises, short when it falls.
        assert!((realized_pnl(Side::Long, 1.0, 110.0, 100.0, 1.0) - 10.0).abs() < 1e-9);
        assert!((realized_pnl(Side::Short, 1.0, 110.0, 100.0, 1.0) + 10.0).abs() < 1e-9);

        let mut pos = Position::default();
        pos.merge_entry(1.0, 100.0, 0, 0.001);
        assert!((pos.unrealized_pnl(Side::Long, 105.0, &rules()) - 5.0).abs() < 1e-9);
        assert!((pos.unrealized_pnl(Side::Short, 105.0, &rules()) + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_wallet_peak_balance() {
        let mut wallet = WalletState::new(1000.0);
        wallet.apply_fill(200.0, 0.0);
        assert_eq!(wallet.balance, 1200.0);
        assert_eq!(wallet.peak_balance(), 1200.0);

        wallet.apply_fill(-300.0, 0.0);
        assert_eq!(wallet.balance, 900.0);
        // cumsum running = -100, max = 200 -> peak = 900 + 300 = 1200
        assert!((wallet.peak_balance() - 1200.0).abs() < 1e-9);
        assert!(wallet.pnl_cumsum_max >= wallet.pnl_cumsum_running);
    }

    #[test]
    fn test_balance_floor() {
        let mut wallet = WalletState::new(100.0);
        wallet.apply_fill(-1e9, 0.0);
        assert!(wallet.balance >= BALANCE_FLOOR);
    }
}

//! Order Model
//!
//! Orders are generated fresh every minute and are not persistent objects.
//! `OrderKind` carries the full provenance of an order (which mechanism
//! produced it, on which side) with a stable numeric code for the fill stream.
//!
//! Per-order control flow is a tagged sum (`OrderOutcome`), not exceptions:
//! min-cost rejections and unmet triggers are `Skip`, never errors.

use crate::candles::MinuteStamp;
use crate::market::SymbolIdx;
use serde::{Deserialize, Serialize};

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short. Used to mirror the long-side order math.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

/// Provenance of a generated order. Codes are stable: long `0..=11`,
/// short `12..=23`, same mechanism order on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderKind {
    EntryInitialNormalLong = 0,
    EntryInitialPartialLong = 1,
    EntryGridNormalLong = 2,
    EntryGridCroppedLong = 3,
    EntryGridInflatedLong = 4,
    EntryTrailingNormalLong = 5,
    EntryTrailingCroppedLong = 6,
    CloseGridNormalLong = 7,
    CloseTrailingNormalLong = 8,
    CloseUnstuckLong = 9,
    CloseAutoReduceLong = 10,
    ClosePanicLong = 11,
    EntryInitialNormalShort = 12,
    EntryInitialPartialShort = 13,
    EntryGridNormalShort = 14,
    EntryGridCroppedShort = 15,
    EntryGridInflatedShort = 16,
    EntryTrailingNormalShort = 17,
    EntryTrailingCroppedShort = 18,
    CloseGridNormalShort = 19,
    CloseTrailingNormalShort = 20,
    CloseUnstuckShort = 21,
    CloseAutoReduceShort = 22,
    ClosePanicShort = 23,
}

impl OrderKind {
    pub const COUNT: usize = 24;

    #[inline]
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use OrderKind::*;
        const ALL: [OrderKind; OrderKind::COUNT] = [
            EntryInitialNormalLong,
            EntryInitialPartialLong,
            EntryGridNormalLong,
            EntryGridCroppedLong,
            EntryGridInflatedLong,
            EntryTrailingNormalLong,
            EntryTrailingCroppedLong,
            CloseGridNormalLong,
            CloseTrailingNormalLong,
            CloseUnstuckLong,
            CloseAutoReduceLong,
            ClosePanicLong,
            EntryInitialNormalShort,
            EntryInitialPartialShort,
            EntryGridNormalShort,
            EntryGridCroppedShort,
            EntryGridInflatedShort,
            EntryTrailingNormalShort,
            EntryTrailingCroppedShort,
            CloseGridNormalShort,
            CloseTrailingNormalShort,
            CloseUnstuckShort,
            CloseAutoReduceShort,
            ClosePanicShort,
        ];
        ALL.get(code as usize).copied()
    }

    #[inline]
    pub fn side(&self) -> Side {
        if self.code() < 12 {
            Side::Long
        } else {
            Side::Short
        }
    }

    #[inline]
    pub fn is_entry(&self) -> bool {
        matches!(self.code() % 12, 0..=6)
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        !self.is_entry()
    }

    /// Market-kind orders cross the spread immediately and pay taker fees.
    #[inline]
    pub fn is_market(&self) -> bool {
        matches!(self.code() % 12, 10 | 11)
    }

    #[inline]
    pub fn is_unstuck(&self) -> bool {
        matches!(self.code() % 12, 9)
    }
}

/// A resting (or market) order the strategy would place this minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: SymbolIdx,
    pub kind: OrderKind,
    pub price: f64,
    pub qty: f64,
}

impl Order {
    #[inline]
    pub fn side(&self) -> Side {
        self.kind.side()
    }
}

/// Why an order slot produced nothing this minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Notional below the exchange `min_cost`; the exchange would reject it.
    BelowMinCost,
    /// Trailing trigger conditions not met.
    TriggerNotMet,
    /// Exposure already at or beyond the per-position limit.
    ExposureFull,
    /// EMA bands not warmed up yet.
    WarmingUp,
    /// Side is disabled for this symbol (forced mode or eligibility).
    SideDisabled,
    /// Position already at or above target initial size.
    AlreadyEntered,
    /// No position to close.
    NoPosition,
}

/// Tagged result of one order-math computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderOutcome {
    Emit(Order),
    Skip(SkipReason),
}

impl OrderOutcome {
    #[inline]
    pub fn order(self) -> Option<Order> {
        match self {
            OrderOutcome::Emit(o) => Some(o),
            OrderOutcome::Skip(_) => None,
        }
    }
}

/// A simulated execution, recorded on the fill stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub ts: MinuteStamp,
    pub symbol: SymbolIdx,
    /// Stable numeric order-kind code (`0..=23`).
    pub kind: u8,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    /// Position size after this fill.
    pub new_size: f64,
    /// Position average price after this fill (0 when flat).
    pub new_price: f64,
}

impl Fill {
    /// Decoded order kind. Fill codes always originate from `OrderKind`.
    #[inline]
    pub fn order_kind(&self) -> OrderKind {
        OrderKind::from_code(self.kind).expect("fill kind codes originate from OrderKind")
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.order_kind().side()
    }
}

//! EMA Band Tracker
//!
//! Three exponential moving averages of close prices with differing spans;
//! the band is their min/max envelope. During warm-up the raw EMA is biased
//! toward the zero initialization, so the tracker keeps the correction weight
//! `w_t = 1 - (1-alpha)^t` and reports `value_t / w_t`.
//!
//! Bands stay `None` until the configured warm-up minute count has elapsed;
//! the order-math layer treats that as "no entries yet".

use serde::{Deserialize, Serialize};

/// Upper/lower envelope of the three EMAs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaBands {
    pub upper: f64,
    pub lower: f64,
}

/// Bias-corrected EMA triplet for one (symbol, side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaTracker {
    alphas: [f64; 3],
    /// Raw (uncorrected) EMA values.
    values: [f64; 3],
    /// `(1 - alpha)^t` per span; correction weight is `1 -` this.
    decay_pow: [f64; 3],
    /// Updates seen so far.
    count: u64,
    /// Bands become valid at this update count.
    warmup_minutes: u64,
}

impl EmaTracker {
    /// `spans` in minutes; `warmup_minutes` gates band validity.
    pub fn new(spans: [f64; 3], warmup_minutes: u64) -> Self {
        let alphas = spans.map(|s| 2.0 / (s.max(1.0) + 1.0));
        Self {
            alphas,
            values: [0.0; 3],
            decay_pow: [1.0; 3],
            count: 0,
            warmup_minutes,
        }
    }

    /// Warm-up bound: `min(max(s0, s1), warmup_ratio * max_span)`.
    pub fn warmup_bound(span_0: f64, span_1: f64, span_2: f64, warmup_ratio: f64) -> u64 {
        let pair_max = span_0.max(span_1);
        let full_max = pair_max.max(span_2);
        pair_max.min(warmup_ratio * full_max).ceil().max(1.0) as u64
    }

    /// Fold in one close price.
    pub fn update(&mut self, close: f64) {
        for i in 0..3 {
            let a = self.alphas[i];
            self.values[i] = self.values[i] * (1.0 - a) + close * a;
            self.decay_pow[i] *= 1.0 - a;
        }
        self.count += 1;
    }

    /// Bias-corrected EMA values.
    pub fn corrected(&self) -> [f64; 3] {
        let mut out = [0.0; 3];
        for i in 0..3 {
            let w = 1.0 - self.decay_pow[i];
            out[i] = if w > 0.0 { self.values[i] / w } else { 0.0 };
        }
        out
    }

    #[inline]
    pub fn is_warm(&self) -> bool {
        self.count >= self.warmup_minutes
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Band envelope, or `None` during warm-up.
    pub fn bands(&self) -> Option<EmaBands> {
        if !self.is_warm() {
            return None;
        }
        let [e0, e1, e2] = self.corrected();
        Some(EmaBands {
            upper: e0.max(e1).max(e2),
            lower: e0.min(e1).min(e2),
        })
    }
}

//! Performance Metrics
//!
//! Streaming accumulators over the minute loop (running extrema, total
//! variation, regression sums) plus a finalization pass that derives the
//! reported metric set. Returns-based metrics work on daily equity samples
//! (1440-minute buckets); path-shape metrics use the full minute series.
//!
//! Ratios guard their denominators explicitly and fall back to 0.0: a
//! degenerate run reports zeros, never NaN.

use crate::candles::MinuteStamp;
use crate::orders::Fill;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};

const MINUTES_PER_DAY: u64 = 1440;
const EPS: f64 = 1e-12;

/// Final metric set computed from the minute and fill streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    // Growth
    /// Geometric mean daily gain.
    pub adg: f64,
    /// Mean of `adg` across the 10 overlapping tail subsets.
    pub adg_w: f64,
    /// Median daily return.
    pub mdg: f64,
    /// Mean of `mdg` across the 10 overlapping tail subsets.
    pub mdg_w: f64,
    /// Total gain: `final_equity / starting_balance - 1`.
    pub gain: f64,

    // Risk
    /// Worst peak-relative drawdown over the full minute series.
    pub drawdown_worst: f64,
    /// Mean of the worst 1% of per-minute drawdowns.
    pub drawdown_worst_mean_1pct: f64,
    /// Mean magnitude of the worst 1% of daily returns.
    pub expected_shortfall_1pct: f64,

    // Risk-adjusted
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub sterling_ratio: f64,
    pub omega_ratio: f64,
    /// `|sum of losing realized pnl| / sum of winning realized pnl`.
    pub loss_profit_ratio: f64,

    // Position behavior
    pub positions_held_per_day: f64,
    pub position_held_hours_mean: f64,
    pub position_held_hours_median: f64,
    pub position_held_hours_max: f64,
    /// Average traded notional per day as a percentage of balance.
    pub volume_pct_per_day_avg: f64,

    // Equity path shape
    /// Total variation of equity over net equity change.
    pub equity_choppiness: f64,
    /// Total second-difference variation over net equity change.
    pub equity_jerkiness: f64,
    /// RMS residual of the least-squares linear fit of `ln(equity)`.
    pub exponential_fit_error: f64,

    // Period
    pub n_days: f64,
    pub n_fills: u64,
    pub total_fees_paid: f64,
    /// RFC3339 period bounds when `ts` is minutes since the Unix epoch.
    pub period_start_utc: Option<String>,
    pub period_end_utc: Option<String>,
}

/// Streaming collector fed by the driver once per minute and once per fill.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    starting_balance: f64,

    // Minute-level streaming state.
    prev_equity: Option<f64>,
    prev_delta: Option<f64>,
    total_variation: f64,
    total_second_variation: f64,
    peak_equity: f64,
    drawdown_worst: f64,
    drawdowns: Vec<f64>,

    // ln(equity) regression sums.
    fit_n: f64,
    fit_sum_t: f64,
    fit_sum_t2: f64,
    fit_sum_y: f64,
    fit_sum_ty: f64,
    fit_sum_y2: f64,

    // Daily sampling.
    minutes_seen: u64,
    last_equity: f64,
    daily_equity: Vec<f64>,

    // Fill-level accumulators.
    profit_sum: f64,
    loss_sum: f64,
    n_fills: u64,
    day_volume_frac: f64,
    daily_volume_fracs: Vec<f64>,

    // Position episodes (minutes held, pushed on full close).
    episode_minutes: Vec<u64>,

    first_ts: Option<MinuteStamp>,
    last_ts: MinuteStamp,
}

impl MetricsCollector {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            starting_balance,
            prev_equity: None,
            prev_delta: None,
            total_variation: 0.0,
            total_second_variation: 0.0,
            peak_equity: starting_balance,
            drawdown_worst: 0.0,
            drawdowns: Vec::new(),
            fit_n: 0.0,
            fit_sum_t: 0.0,
            fit_sum_t2: 0.0,
            fit_sum_y: 0.0,
            fit_sum_ty: 0.0,
            fit_sum_y2: 0.0,
            minutes_seen: 0,
            last_equity: starting_balance,
            daily_equity: vec![starting_balance],
            profit_sum: 0.0,
            loss_sum: 0.0,
            n_fills: 0,
            day_volume_frac: 0.0,
            daily_volume_fracs: Vec::new(),
            episode_minutes: Vec::new(),
            first_ts: None,
            last_ts: 0,
        }
    }

    /// Fold in one minute-close observation.
    pub fn on_minute(&mut self, ts: MinuteStamp, equity: f64) {
        if self.first_ts.is_none() {
            self.first_ts = Some(ts);
        }
        self.last_ts = ts;

        if let Some(prev) = self.prev_equity {
            let delta = equity - prev;
            self.total_variation += delta.abs();
            if let Some(pd) = self.prev_delta {
                self.total_second_variation += (delta - pd).abs();
            }
            self.prev_delta = Some(delta);
        }
        self.prev_equity = Some(equity);

        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let dd = if self.peak_equity > 0.0 {
            (self.peak_equity - equity) / self.peak_equity
        } else {
            0.0
        };
        self.drawdowns.push(dd);
        if dd > self.drawdown_worst {
            self.drawdown_worst = dd;
        }

        // ln-fit sample, floored away from zero.
        let t = self.minutes_seen as f64;
        let y = equity.max(EPS).ln();
        self.fit_n += 1.0;
        self.fit_sum_t += t;
        self.fit_sum_t2 += t * t;
        self.fit_sum_y += y;
        self.fit_sum_ty += t * y;
        self.fit_sum_y2 += y * y;

        self.minutes_seen += 1;
        self.last_equity = equity;
        if self.minutes_seen % MINUTES_PER_DAY == 0 {
            self.daily_equity.push(equity);
            self.daily_volume_fracs.push(self.day_volume_frac);
            self.day_volume_frac = 0.0;
        }
    }

    /// Fold in one fill. `balance` is the balance at fill time.
    pub fn on_fill(&mut self, fill: &Fill, balance: f64, c_mult: f64) {
        self.n_fills += 1;
        if fill.realized_pnl > 0.0 {
            self.profit_sum += fill.realized_pnl;
        } else {
            self.loss_sum += fill.realized_pnl;
        }
        let notional = fill.qty.abs() * fill.price * c_mult;
        self.day_volume_frac += notional / balance.max(EPS);
    }

    /// Record a closed position episode (minutes from open to full close).
    pub fn on_episode_closed(&mut self, minutes_held: u64) {
        self.episode_minutes.push(minutes_held);
    }

    /// Finish the run and derive the report. `total_fees_paid` comes from the
    /// wallet; `epoch_minutes` marks `ts` as minutes since the Unix epoch for
    /// period formatting (None leaves the period fields empty).
    pub fn finalize(mut self, total_fees_paid: f64, epoch_minutes: bool) -> MetricsReport {
        // Close the partial trailing day so short runs still report.
        if self.minutes_seen % MINUTES_PER_DAY != 0 {
            self.daily_equity.push(self.last_equity);
            self.daily_volume_fracs.push(self.day_volume_frac);
        }

        let n_days = (self.minutes_seen as f64 / MINUTES_PER_DAY as f64).max(EPS);
        let final_equity = self.last_equity;
        let gain = final_equity / self.starting_balance - 1.0;

        let daily_returns: Vec<f64> = self
            .daily_equity
            .windows(2)
            .map(|w| if w[0] > EPS { w[1] / w[0] - 1.0 } else { 0.0 })
            .collect();

        let adg = geometric_daily_gain(self.starting_balance, final_equity, n_days);
        let mdg = median(&daily_returns);
        let (adg_w, mdg_w) = tail_window_means(&self.daily_equity, &daily_returns);

        let mean_r = if daily_returns.is_empty() {
            0.0
        } else {
            (&daily_returns[..]).mean()
        };
        let std_r = if daily_returns.len() > 1 {
            (&daily_returns[..]).std_dev()
        } else {
            0.0
        };
        let sharpe_ratio = if std_r > EPS { mean_r / std_r } else { 0.0 };

        let downside: Vec<f64> = daily_returns
            .iter()
            .filter(|&&r| r < 0.0)
            .map(|&r| r * r)
            .collect();
        let sortino_ratio = if downside.is_empty() {
            0.0
        } else {
            let dd = (&downside[..]).mean().sqrt();
            if dd > EPS {
                mean_r / dd
            } else {
                0.0
            }
        };

        let pos_sum: f64 = daily_returns.iter().filter(|&&r| r > 0.0).sum();
        let neg_sum: f64 = daily_returns.iter().filter(|&&r| r < 0.0).sum();
        let omega_ratio = if neg_sum.abs() > EPS {
            pos_sum / neg_sum.abs()
        } else {
            0.0
        };

        let drawdown_worst_mean_1pct = worst_tail_mean(&self.drawdowns, 0.01, true);
        let expected_shortfall_1pct = worst_tail_mean(&daily_returns, 0.01, false).abs();

        let calmar_ratio = if self.drawdown_worst > EPS {
            adg / self.drawdown_worst
        } else {
            0.0
        };
        let sterling_ratio = if drawdown_worst_mean_1pct > EPS {
            adg / drawdown_worst_mean_1pct
        } else {
            0.0
        };

        let loss_profit_ratio = if self.profit_sum > EPS {
            self.loss_sum.abs() / self.profit_sum
        } else {
            0.0
        };

        let hours: Vec<f64> = self
            .episode_minutes
            .iter()
            .map(|&m| m as f64 / 60.0)
            .collect();
        let position_held_hours_mean = if hours.is_empty() {
            0.0
        } else {
            (&hours[..]).mean()
        };
        let position_held_hours_median = median(&hours);
        let position_held_hours_max = hours.iter().cloned().fold(0.0, f64::max);

        let volume_pct_per_day_avg = if self.daily_volume_fracs.is_empty() {
            0.0
        } else {
            (&self.daily_volume_fracs[..]).mean() * 100.0
        };

        let net_change = (final_equity - self.starting_balance).abs().max(EPS);
        let equity_choppiness = self.total_variation / net_change;
        let equity_jerkiness = self.total_second_variation / net_change;
        let exponential_fit_error = self.ln_fit_rms();

        let (period_start_utc, period_end_utc) = if epoch_minutes {
            (
                format_minute(self.first_ts.unwrap_or(0)),
                format_minute(self.last_ts),
            )
        } else {
            (None, None)
        };

        MetricsReport {
            adg,
            adg_w,
            mdg,
            mdg_w,
            gain,
            drawdown_worst: self.drawdown_worst,
            drawdown_worst_mean_1pct,
            expected_shortfall_1pct,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            sterling_ratio,
            omega_ratio,
            loss_profit_ratio,
            positions_held_per_day: self.episode_minutes.len() as f64 / n_days,
            position_held_hours_mean,
            position_held_hours_median,
            position_held_hours_max,
            volume_pct_per_day_avg,
            equity_choppiness,
            equity_jerkiness,
            exponential_fit_error,
            n_days,
            n_fills: self.n_fills,
            total_fees_paid,
            period_start_utc,
            period_end_utc,
        }
    }

    /// RMS residual of the least-squares line through `(t, ln equity)`.
    fn ln_fit_rms(&self) -> f64 {
        let n = self.fit_n;
        if n < 2.0 {
            return 0.0;
        }
        let det = n * self.fit_sum_t2 - self.fit_sum_t * self.fit_sum_t;
        if det.abs() < EPS {
            return 0.0;
        }
        let slope = (n * self.fit_sum_ty - self.fit_sum_t * self.fit_sum_y) / det;
        let intercept = (self.fit_sum_y - slope * self.fit_sum_t) / n;
        let sse = self.fit_sum_y2
            - 2.0 * (slope * self.fit_sum_ty + intercept * self.fit_sum_y)
            + slope * slope * self.fit_sum_t2
            + 2.0 * slope * intercept * self.fit_sum_t
            + n * intercept * intercept;
        (sse.max(0.0) / n).sqrt()
    }
}

/// Geometric mean daily gain between two equity levels.
fn geometric_daily_gain(initial: f64, final_equity: f64, days: f64) -> f64 {
    if initial <= EPS || final_equity <= 0.0 || days <= EPS {
        return 0.0;
    }
    (final_equity / initial).powf(1.0 / days) - 1.0
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut data = Data::new(values.to_vec());
    data.median()
}

/// Mean of `adg`/`mdg` over the 10 overlapping tail subsets
/// `[0..N], [N/2..N], [2N/3..N], ..., [9N/10..N]`.
fn tail_window_means(daily_equity: &[f64], daily_returns: &[f64]) -> (f64, f64) {
    let n = daily_returns.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mut adg_sum = 0.0;
    let mut mdg_sum = 0.0;
    for i in 0..10usize {
        let start = n * i / (i + 1);
        let days = (n - start) as f64;
        // daily_equity[start] is the equity at the subset's first day open.
        let adg_i = geometric_daily_gain(
            daily_equity[start].max(EPS),
            *daily_equity.last().expect("non-empty by construction"),
            days.max(EPS),
        );
        let mdg_i = median(&daily_returns[start..]);
        adg_sum += adg_i;
        mdg_sum += mdg_i;
    }
    (adg_sum / 10.0, mdg_sum / 10.0)
}

/// Mean of the worst 1% tail. `largest` selects the upper tail (drawdowns);
/// otherwise the lower tail (returns).
fn worst_tail_mean(values: &[f64], pct: f64, largest: bool) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut data = Data::new(values.to_vec());
    let threshold = if largest {
        data.percentile(((1.0 - pct) * 100.0) as usize)
    } else {
        data.percentile((pct * 100.0) as usize)
    };
    let tail: Vec<f64> = values
        .iter()
        .filter(|&&v| if largest { v >= threshold } else { v <= threshold })
        .cloned()
        .collect();
    if tail.is_empty() {
        0.0
    } else {
        (&tail[..]).mean()
    }
}

fn format_minute(ts: MinuteStamp) -> Option<String> {
    Utc.timestamp_opt(ts as i64 * 60, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_flat_days(collector: &mut MetricsCollector, days: u64, equity: f64) {
        let start = collector.minutes_seen;
        for m in 0..days * MINUTES_PER_DAY {
            collector.on_minute(start + m, equity);
        }
    }

    #[test]
    fn test_gain_and_adg_on_steady_growth() {
        let mut c = MetricsCollector::new(1000.0);
        // Equity doubles linearly over 4 days.
        let total = 4 * MINUTES_PER_DAY;
        for m in 0..total {
            let equity = 1000.0 + 1000.0 * (m + 1) as f64 / total as f64;
            c.on_minute(m, equity);
        }
        let report = c.finalize(0.0, false);
        assert!((report.gain - 1.0).abs() < 1e-9);
        // adg: 2^(1/4) - 1
        assert!((report.adg - (2.0f64.powf(0.25) - 1.0)).abs() < 1e-9);
        assert!((report.n_days - 4.0).abs() < 1e-9);
        // Monotonic growth: no drawdown, omega degenerates to 0 guard or
        // positive depending on returns; drawdown must be zero.
        assert_eq!(report.drawdown_worst, 0.0);
    }

    #[test]
    fn test_drawdown_worst() {
        let mut c = MetricsCollector::new(1000.0);
        c.on_minute(0, 1000.0);
        c.on_minute(1, 1200.0);
        c.on_minute(2, 900.0);
        c.on_minute(3, 1100.0);
        let report = c.finalize(0.0, false);
        // 1200 -> 900 = 25%.
        assert!((report.drawdown_worst - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_mdg_median_of_daily_returns() {
        let mut c = MetricsCollector::new(1000.0);
        // Day closes: 1100 (+10%), 990 (-10%), 1188 (+20%).
        for (day, eq) in [(0u64, 1100.0), (1, 990.0), (2, 1188.0)] {
            for m in 0..MINUTES_PER_DAY {
                c.on_minute(day * MINUTES_PER_DAY + m, eq);
            }
        }
        let report = c.finalize(0.0, false);
        assert!((report.mdg - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_loss_profit_ratio() {
        let mut c = MetricsCollector::new(1000.0);
        let fill = |pnl: f64| Fill {
            ts: 0,
            symbol: 0,
            kind: 7,
            price: 100.0,
            qty: 1.0,
            fee: 0.0,
            realized_pnl: pnl,
            new_size: 0.0,
            new_price: 0.0,
        };
        c.on_fill(&fill(30.0), 1000.0, 1.0);
        c.on_fill(&fill(-10.0), 1000.0, 1.0);
        c.on_fill(&fill(20.0), 1000.0, 1.0);
        feed_flat_days(&mut c, 1, 1040.0);
        let report = c.finalize(0.0, false);
        assert!((report.loss_profit_ratio - 10.0 / 50.0).abs() < 1e-9);
        assert_eq!(report.n_fills, 3);
    }

    #[test]
    fn test_position_hold_stats() {
        let mut c = MetricsCollector::new(1000.0);
        c.on_episode_closed(60);
        c.on_episode_closed(120);
        c.on_episode_closed(600);
        feed_flat_days(&mut c, 2, 1000.0);
        let report = c.finalize(0.0, false);
        assert!((report.positions_held_per_day - 1.5).abs() < 1e-9);
        assert!((report.position_held_hours_mean - (1.0 + 2.0 + 10.0) / 3.0).abs() < 1e-9);
        assert!((report.position_held_hours_median - 2.0).abs() < 1e-9);
        assert!((report.position_held_hours_max - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_choppiness_straight_line_is_minimal() {
        // A straight ramp has total variation equal to the net change:
        // choppiness exactly 1, jerkiness ~0.
        let mut c = MetricsCollector::new(1000.0);
        for m in 0..100 {
            c.on_minute(m, 1000.0 + m as f64);
        }
        let report = c.finalize(0.0, false);
        assert!((report.equity_choppiness - 1.0).abs() < 0.02);
        assert!(report.equity_jerkiness < 0.01);
    }

    #[test]
    fn test_choppy_path_scores_higher() {
        let mut smooth = MetricsCollector::new(1000.0);
        let mut choppy = MetricsCollector::new(1000.0);
        for m in 0..200 {
            smooth.on_minute(m, 1000.0 + m as f64);
            let wiggle = if m % 2 == 0 { 15.0 } else { -15.0 };
            choppy.on_minute(m, 1000.0 + m as f64 + wiggle);
        }
        let smooth_report = smooth.finalize(0.0, false);
        let choppy_report = choppy.finalize(0.0, false);
        assert!(choppy_report.equity_choppiness > smooth_report.equity_choppiness * 2.0);
        assert!(choppy_report.equity_jerkiness > smooth_report.equity_jerkiness);
    }

    #[test]
    fn test_exponential_fit_error_zero_for_exponential_path() {
        // The residual is computed from accumulated sums, so pure exponential
        // growth leaves only cancellation noise.
        let mut c = MetricsCollector::new(1000.0);
        for m in 0..500 {
            c.on_minute(m, 1000.0 * (1.0002f64).powi(m as i32));
        }
        let report = c.finalize(0.0, false);
        assert!(report.exponential_fit_error < 1e-5);

        // A path that alternates around the trend fits worse.
        let mut c2 = MetricsCollector::new(1000.0);
        for m in 0..500 {
            let wiggle = if m % 2 == 0 { 1.03 } else { 0.97 };
            c2.on_minute(m, 1000.0 * (1.0002f64).powi(m as i32) * wiggle);
        }
        let noisy = c2.finalize(0.0, false);
        assert!(noisy.exponential_fit_error > report.exponential_fit_error * 100.0);
    }

    #[test]
    fn test_tail_windows_weight_recent_performance() {
        // Flat for 8 days, then strong growth in the last 2: the tail-window
        // adg exceeds the whole-period adg.
        let mut c = MetricsCollector::new(1000.0);
        for day in 0..10u64 {
            let eq = if day < 8 {
                1000.0
            } else {
                1000.0 * (1.1f64).powi((day - 7) as i32)
            };
            for m in 0..MINUTES_PER_DAY {
                c.on_minute(day * MINUTES_PER_DAY + m, eq);
            }
        }
        let report = c.finalize(0.0, false);
        assert!(report.adg_w > report.adg);
        assert!(report.mdg_w >= report.mdg);
    }

    #[test]
    fn test_period_formatting() {
        let mut c = MetricsCollector::new(1000.0);
        // 2021-01-01T00:00 in epoch-minutes.
        let start = 26_824_320;
        c.on_minute(start, 1000.0);
        c.on_minute(start + 1, 1001.0);
        let report = c.finalize(0.0, true);
        assert!(report.period_start_utc.unwrap().starts_with("2021-01-01T00:00"));
    }
}

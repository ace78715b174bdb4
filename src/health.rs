// =============================================================================
// Health/KPI Tracker — rolling performance metrics over a bounded bar window
// =============================================================================
//
// Tracks rolling Sharpe, max drawdown (peak-to-trough over cumulative
// returns), in-band share (|pred_cal_bps| <= band_bps), hit-rate, and
// turnover over a bounded trailing window using fixed-size ring buffers.
// A snapshot is taken every `health_emit_every_bars` bars by the driver and
// handed to the emitter's `health` stream.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub sharpe_roll: Option<f64>,
    pub max_drawdown: f64,
    pub in_band_share: Option<f64>,
    pub hit_rate: Option<f64>,
    pub turnover_bps: f64,
    pub bars_observed: u32,
    /// Transient I/O retried-and-continued (candle/funding poll timeouts,
    /// rate limits, WS-equivalent reconnects).
    pub transient_errors: u32,
    /// Data anomalies skipped rather than raised (non-monotonic timestamp,
    /// duplicate bar, missing field).
    pub data_anomalies: u32,
}

struct Inner {
    returns: VecDeque<f64>,
    turnover: VecDeque<f64>,
    inband_flags: VecDeque<bool>,
    cumulative_return: f64,
    peak_equity: f64,
    max_drawdown: f64,
    wins: u32,
    losses: u32,
    bars_observed: u32,
    transient_errors: u32,
    data_anomalies: u32,
}

/// `bars_per_year` used for the Sharpe annualization factor, matching
/// `risk.rs`'s realized-vol annualization convention
/// (`525600 / bar_minutes`).
pub struct HealthTracker {
    inner: RwLock<Inner>,
    window: usize,
    bars_per_year: f64,
}

impl HealthTracker {
    pub fn new(window_bars: usize, bar_minutes: f64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                returns: VecDeque::new(),
                turnover: VecDeque::new(),
                inband_flags: VecDeque::new(),
                cumulative_return: 0.0,
                peak_equity: 0.0,
                max_drawdown: 0.0,
                wins: 0,
                losses: 0,
                bars_observed: 0,
                transient_errors: 0,
                data_anomalies: 0,
            }),
            window: window_bars.max(2),
            bars_per_year: if bar_minutes > 0.0 {
                525_600.0 / bar_minutes
            } else {
                525_600.0
            },
        }
    }

    pub fn update_bar(&self, bar_return: f64, realized_pnl: Option<f64>, turnover_bps: f64, pred_cal_bps: f64, band_bps: f64) {
        let mut inner = self.inner.write();
        inner.bars_observed += 1;

        inner.returns.push_back(bar_return);
        while inner.returns.len() > self.window {
            inner.returns.pop_front();
        }

        inner.turnover.push_back(turnover_bps);
        while inner.turnover.len() > self.window {
            inner.turnover.pop_front();
        }

        inner.inband_flags.push_back(pred_cal_bps.abs() <= band_bps);
        while inner.inband_flags.len() > self.window {
            inner.inband_flags.pop_front();
        }

        inner.cumulative_return += bar_return;
        if inner.cumulative_return > inner.peak_equity {
            inner.peak_equity = inner.cumulative_return;
        } else {
            let drawdown = inner.cumulative_return - inner.peak_equity;
            if drawdown < inner.max_drawdown {
                inner.max_drawdown = drawdown;
            }
        }

        if let Some(pnl) = realized_pnl {
            if pnl > 0.0 {
                inner.wins += 1;
            } else if pnl < 0.0 {
                inner.losses += 1;
            }
        }
    }

    /// Record a retried-and-continued transient I/O error.
    pub fn record_transient(&self) {
        self.inner.write().transient_errors += 1;
    }

    /// Record a skipped data anomaly.
    pub fn record_anomaly(&self) {
        self.inner.write().data_anomalies += 1;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.read();

        let sharpe_roll = if inner.returns.len() >= 2 {
            let n = inner.returns.len() as f64;
            let mean = inner.returns.iter().sum::<f64>() / n;
            let var = inner.returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let std = var.sqrt();
            if std > 0.0 {
                Some((mean / std) * self.bars_per_year.sqrt())
            } else {
                Some(0.0)
            }
        } else {
            None
        };

        let in_band_share = if inner.inband_flags.is_empty() {
            None
        } else {
            let hits = inner.inband_flags.iter().filter(|&&f| f).count();
            Some(hits as f64 / inner.inband_flags.len() as f64)
        };

        let total_trades = inner.wins + inner.losses;
        let hit_rate = if total_trades > 0 {
            Some(inner.wins as f64 / total_trades as f64)
        } else {
            None
        };

        let turnover_bps = if inner.turnover.is_empty() {
            0.0
        } else {
            inner.turnover.iter().sum::<f64>() / inner.turnover.len() as f64
        };

        HealthSnapshot {
            sharpe_roll,
            max_drawdown: inner.max_drawdown,
            in_band_share,
            hit_rate,
            turnover_bps,
            bars_observed: inner.bars_observed,
            transient_errors: inner.transient_errors,
            data_anomalies: inner.data_anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let tracker = HealthTracker::new(100, 5.0);
        tracker.update_bar(0.02, None, 0.0, 0.0, 5.0);
        tracker.update_bar(-0.05, None, 0.0, 0.0, 5.0);
        tracker.update_bar(0.01, None, 0.0, 0.0, 5.0);
        let snap = tracker.snapshot();
        assert!(snap.max_drawdown < 0.0);
        assert!((snap.max_drawdown - (-0.05)).abs() < 1e-9);
    }

    #[test]
    fn hit_rate_counts_wins_and_losses() {
        let tracker = HealthTracker::new(100, 5.0);
        tracker.update_bar(0.0, Some(10.0), 0.0, 0.0, 5.0);
        tracker.update_bar(0.0, Some(-5.0), 0.0, 0.0, 5.0);
        tracker.update_bar(0.0, Some(3.0), 0.0, 0.0, 5.0);
        let snap = tracker.snapshot();
        assert!((snap.hit_rate.unwrap() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn in_band_share_tracks_rolling_window() {
        let tracker = HealthTracker::new(2, 5.0);
        tracker.update_bar(0.0, None, 0.0, 1.0, 5.0); // in band
        tracker.update_bar(0.0, None, 0.0, 20.0, 5.0); // out of band
        let snap = tracker.snapshot();
        assert!((snap.in_band_share.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn no_returns_yields_no_sharpe() {
        let tracker = HealthTracker::new(100, 5.0);
        let snap = tracker.snapshot();
        assert!(snap.sharpe_roll.is_none());
    }

    #[test]
    fn turnover_bps_is_a_rolling_average_not_a_sum() {
        let tracker = HealthTracker::new(100, 5.0);
        tracker.update_bar(0.0, None, 10.0, 0.0, 5.0);
        tracker.update_bar(0.0, None, 20.0, 0.0, 5.0);
        tracker.update_bar(0.0, None, 30.0, 0.0, 5.0);
        let snap = tracker.snapshot();
        assert!((snap.turnover_bps - 20.0).abs() < 1e-9);
    }
}

// =============================================================================
// Risk Engine — vol-targeted sizing, rebalance cooldown, warmup skip, and
// the session daily-stop drawdown breaker
// =============================================================================
//
// Vol-targeted sizing (`bars_per_year = 525600/bar_minutes` annualization
// with `vol_floor` fallback), bar-denominated rebalance cooldown, and a
// peak-equity daily drawdown stop. The pre-trade guard chain (spread/
// funding/flip/impact/net-edge/throttle/ADV/calibration) lives in
// `guards.rs`; this engine only decides target exposure and whether
// trading is permitted at all right now.
// =============================================================================

use std::collections::VecDeque;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of the risk engine's internal state for dashboards/logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub rv_annualized: f64,
    pub bars_seen: u64,
    pub in_cooldown: bool,
    pub warmup_active: bool,
    pub daily_stopped: bool,
    pub peak_equity: f64,
    pub cum_pnl: f64,
    pub drawdown_pct: f64,
    pub current_day_key: String,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    returns: VecDeque<f64>,
    cooldown_until_ms: i64,
    bars_seen: u64,
    peak_equity: f64,
    cum_pnl: f64,
    daily_stopped: bool,
    current_day_key: String,
}

// ---------------------------------------------------------------------------
// Risk Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    state: RwLock<Inner>,
    cfg: RiskConfig,
    tz: Tz,
    starting_equity: f64,
}

impl RiskEngine {
    pub fn new(cfg: RiskConfig, tz: Tz, starting_equity: f64) -> Self {
        let day_key = Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string();
        info!(
            sigma_target = cfg.sigma_target,
            pos_max = cfg.pos_max,
            cooldown_bars = cfg.cooldown_bars,
            warmup_skip_bars = cfg.warmup_skip_bars,
            daily_stop_dd_pct = cfg.daily_stop_dd_pct,
            "RiskEngine initialised"
        );
        Self {
            state: RwLock::new(Inner {
                returns: VecDeque::with_capacity(cfg.realized_vol_window as usize + 1),
                cooldown_until_ms: 0,
                bars_seen: 0,
                peak_equity: starting_equity,
                cum_pnl: 0.0,
                daily_stopped: false,
                current_day_key: day_key,
            }),
            cfg,
            tz,
            starting_equity,
        }
    }

    // -------------------------------------------------------------------------
    // Realized vol / sizing
    // -------------------------------------------------------------------------

    /// Push one bar's close-to-close return into the realized-vol window.
    pub fn update_returns(&self, prev_close: f64, new_close: f64) {
        if prev_close <= 0.0 || new_close <= 0.0 {
            return;
        }
        let r = (new_close / prev_close) - 1.0;
        let mut s = self.state.write();
        s.returns.push_back(r);
        while s.returns.len() > self.cfg.realized_vol_window as usize {
            s.returns.pop_front();
        }
    }

    fn realized_vol_locked(&self, s: &Inner) -> f64 {
        if s.returns.len() < 2 {
            return 0.0;
        }
        let n = s.returns.len() as f64;
        let mean = s.returns.iter().sum::<f64>() / n;
        let var = s.returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let bars_per_year = 525_600.0 / self.cfg.bar_minutes.max(1e-9);
        var.max(0.0).sqrt() * bars_per_year.sqrt()
    }

    /// Annualized realized volatility, `std(returns, ddof=1) * sqrt(bars_per_year)`.
    pub fn realized_vol(&self) -> f64 {
        let s = self.state.read();
        self.realized_vol_locked(&s)
    }

    /// Vol-targeted target exposure fraction in `[-pos_max, pos_max]`.
    ///
    /// Returns 0 if realized vol is unavailable and no `vol_floor` is set.
    pub fn target_position(&self, direction: i32, alpha: f64) -> f64 {
        if direction == 0 {
            return 0.0;
        }
        let s = self.state.read();
        let mut rv = self.realized_vol_locked(&s);
        if rv <= 0.0 {
            if self.cfg.vol_floor > 0.0 {
                rv = self.cfg.vol_floor;
            } else {
                return 0.0;
            }
        }
        let pos = (self.cfg.sigma_target / rv) * alpha;
        let pos = pos.clamp(-self.cfg.pos_max, self.cfg.pos_max);
        direction as f64 * pos
    }

    // -------------------------------------------------------------------------
    // Cooldown
    // -------------------------------------------------------------------------

    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        now_ms < self.state.read().cooldown_until_ms
    }

    /// Start a cooldown window from the bar's close timestamp.
    pub fn set_cooldown(&self, last_kline_close_ms: i64) {
        let bar_ms = self.cfg.bar_minutes.max(1.0) * 60_000.0;
        let until = last_kline_close_ms + (self.cfg.cooldown_bars as f64 * bar_ms) as i64;
        self.state.write().cooldown_until_ms = until;
    }

    // -------------------------------------------------------------------------
    // Warmup skip
    // -------------------------------------------------------------------------

    /// Record that a bar was processed; returns the running bar count.
    pub fn record_bar_seen(&self) -> u64 {
        let mut s = self.state.write();
        s.bars_seen += 1;
        s.bars_seen
    }

    /// True for the first `warmup_skip_bars` bars: trades always execute to flat.
    pub fn warmup_active(&self) -> bool {
        self.state.read().bars_seen <= self.cfg.warmup_skip_bars as u64
    }

    // -------------------------------------------------------------------------
    // Daily drawdown stop
    // -------------------------------------------------------------------------

    /// Record a realized PnL delta (from a closed or partially-closed trade)
    /// against the session's peak equity, tripping the daily stop if the
    /// drawdown from peak exceeds `daily_stop_dd_pct`.
    pub fn record_pnl(&self, pnl: f64, now_ms: i64) {
        let mut s = self.state.write();
        self.maybe_roll_day(&mut s, now_ms);

        s.cum_pnl += pnl;
        let equity = self.starting_equity + s.cum_pnl;
        if equity > s.peak_equity {
            s.peak_equity = equity;
        }
        let drawdown = if s.peak_equity > 0.0 {
            (s.peak_equity - equity) / s.peak_equity
        } else {
            0.0
        };
        if self.cfg.daily_stop_dd_pct > 0.0 && drawdown >= self.cfg.daily_stop_dd_pct && !s.daily_stopped {
            s.daily_stopped = true;
            warn!(
                drawdown_pct = drawdown * 100.0,
                limit_pct = self.cfg.daily_stop_dd_pct * 100.0,
                "daily drawdown stop tripped — forcing target to flat"
            );
        }
        debug!(pnl, cum_pnl = s.cum_pnl, equity, drawdown, "risk: pnl recorded");
    }

    /// True once the session's daily drawdown stop has tripped; cleared
    /// automatically when the configured day boundary rolls.
    pub fn daily_stopped(&self, now_ms: i64) -> bool {
        let mut s = self.state.write();
        self.maybe_roll_day(&mut s, now_ms);
        s.daily_stopped
    }

    fn maybe_roll_day(&self, s: &mut Inner, now_ms: i64) {
        let now = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.tz);
        let day_key = now.format("%Y-%m-%d").to_string();
        if day_key != s.current_day_key {
            info!(old_day = %s.current_day_key, new_day = %day_key, "risk day rolled — resetting daily stop");
            s.current_day_key = day_key;
            s.peak_equity = self.starting_equity + s.cum_pnl;
            s.daily_stopped = false;
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn get_state(&self, now_ms: i64) -> RiskState {
        let mut s = self.state.write();
        self.maybe_roll_day(&mut s, now_ms);
        let rv_annualized = self.realized_vol_locked(&s);
        let equity = self.starting_equity + s.cum_pnl;
        let drawdown_pct = if s.peak_equity > 0.0 {
            (s.peak_equity - equity) / s.peak_equity * 100.0
        } else {
            0.0
        };
        RiskState {
            rv_annualized,
            bars_seen: s.bars_seen,
            in_cooldown: now_ms < s.cooldown_until_ms,
            warmup_active: s.bars_seen <= self.cfg.warmup_skip_bars as u64,
            daily_stopped: s.daily_stopped,
            peak_equity: s.peak_equity,
            cum_pnl: s.cum_pnl,
            drawdown_pct,
            current_day_key: s.current_day_key.clone(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("sigma_target", &self.cfg.sigma_target)
            .field("pos_max", &self.cfg.pos_max)
            .field("daily_stop_dd_pct", &self.cfg.daily_stop_dd_pct)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskConfig {
        RiskConfig {
            sigma_target: 0.2,
            pos_max: 1.0,
            cooldown_bars: 1,
            bar_minutes: 5.0,
            realized_vol_window: 50,
            base_notional: 5000.0,
            vol_floor: 0.0,
            adv_cap_pct: 0.0,
            rebalance_min_pos_delta: 0.0,
            daily_stop_dd_pct: 0.05,
            warmup_skip_bars: 2,
            cost_bps: 5.0,
            slippage_bps: 0.0,
            impact_k: 0.0,
            max_impact_bps_hard: 200.0,
            enable_net_edge_gating: true,
            min_net_edge_bps: 10.0,
            max_total_cost_bps: 25.0,
            enable_forced_exits: true,
            max_position_duration_bars: 288,
            stop_loss_bps: 200.0,
            take_profit_bps: 300.0,
        }
    }

    #[test]
    fn target_position_is_zero_without_vol_or_floor() {
        let eng = RiskEngine::new(cfg(), chrono_tz::UTC, 100_000.0);
        assert_eq!(eng.target_position(1, 0.5), 0.0);
    }

    #[test]
    fn target_position_uses_vol_floor_when_no_returns() {
        let mut c = cfg();
        c.vol_floor = 0.2;
        let eng = RiskEngine::new(c, chrono_tz::UTC, 100_000.0);
        let pos = eng.target_position(1, 0.5);
        assert!((pos - 0.5).abs() < 1e-9);
    }

    /// Spec §8 Scenario 1, literal inputs: `sigma_target=0.2, pos_max=1.0,
    /// vol_floor=0, alpha=0.8, dir=1, realized_vol=1.0` => `target_position
    /// = 0.16`. `vol_floor` injects `realized_vol` directly since no returns
    /// have been pushed yet. Doubling realized vol to 2.0 (the "scaling to
    /// 0.5 min" case) halves the target to 0.08.
    #[test]
    fn target_position_spec_scenario_1_literal_values() {
        let mut c = cfg();
        c.sigma_target = 0.2;
        c.pos_max = 1.0;
        c.vol_floor = 1.0;
        let eng = RiskEngine::new(c.clone(), chrono_tz::UTC, 100_000.0);
        let pos = eng.target_position(1, 0.8);
        assert!((pos - 0.16).abs() < 1e-9);

        c.vol_floor = 2.0;
        let eng_halved = RiskEngine::new(c, chrono_tz::UTC, 100_000.0);
        let pos_halved = eng_halved.target_position(1, 0.8);
        assert!((pos_halved - 0.08).abs() < 1e-9);
    }

    #[test]
    fn warmup_active_for_first_n_bars() {
        let eng = RiskEngine::new(cfg(), chrono_tz::UTC, 100_000.0);
        assert!(eng.warmup_active());
        eng.record_bar_seen();
        assert!(eng.warmup_active());
        eng.record_bar_seen();
        assert!(!eng.warmup_active());
    }

    #[test]
    fn cooldown_blocks_until_expiry() {
        let eng = RiskEngine::new(cfg(), chrono_tz::UTC, 100_000.0);
        eng.set_cooldown(1_000_000);
        assert!(eng.in_cooldown(1_000_000 + 60_000));
        assert!(!eng.in_cooldown(1_000_000 + 5 * 60_000 + 1));
    }

    #[test]
    fn daily_stop_trips_on_drawdown_and_clears_next_day() {
        let eng = RiskEngine::new(cfg(), chrono_tz::UTC, 100_000.0);
        let day1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
        eng.record_pnl(-6_000.0, day1);
        assert!(eng.daily_stopped(day1));
        let day2 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap().timestamp_millis();
        assert!(!eng.daily_stopped(day2));
    }
}

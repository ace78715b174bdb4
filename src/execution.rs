// =============================================================================
// Paper Executor — precision clamping, slippage/fee/impact simulation, and
// the two mirroring modes (Market, Passive-then-cross)
// =============================================================================
//
// Clamps a target exposure to exchange precision (step size, min qty,
// min notional), then simulates the fill: slippage in the trade direction,
// weighted-avg-price same-side adds, realized PnL on close plus flip-to-new-
// price, and quadratic impact cost. The ADV notional cap applies before step
// clamping, and a no-trade band suppresses sub-threshold rebalances. Passive-
// then-cross rests 25% of displayed top-of-book size before crossing the
// remainder. Forced exits (model reversal, max duration, stop-loss,
// take-profit) are configurable thresholds, not fixed constants.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ExecutionConfig, RiskConfig};
use crate::data_model::Position;
use crate::types::Side;
use crate::venue::{BookTicker, SymbolFilters};

/// Exit-confidence thresholds used by the model-reversal forced exit. Not
/// configurable in `RiskConfig`; kept as the original's relaxed defaults so
/// a reversing model signal can close a position before it would clear the
/// entry thresholds for a fresh position in the new direction.
const EXIT_CONF_MIN: f64 = 0.40;
const EXIT_ALPHA_MIN: f64 = 0.30;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One simulated fill leg (a passive rest or a market cross).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FillLeg {
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub impact: f64,
}

/// Full report of a mirrored rebalance, covering one or two fill legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReport {
    pub side: Side,
    pub target_qty: f64,
    pub delta_qty: f64,
    pub avg_price: f64,
    pub mid_price: f64,
    pub passive: Option<FillLeg>,
    pub cross: Option<FillLeg>,
    pub total_fee: f64,
    pub total_impact: f64,
    pub realized_pnl_delta: f64,
    pub position: Position,
}

/// Reason a position was force-closed ahead of a guard-gated rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedExitReason {
    ModelReversal,
    MaxDuration,
    StopLoss,
    TakeProfit,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    position: Position,
    entry_bar_id: Option<u64>,
    entry_price: Option<f64>,
    filters: Option<SymbolFilters>,
}

// ---------------------------------------------------------------------------
// Paper Executor
// ---------------------------------------------------------------------------

pub struct PaperExecutor {
    state: RwLock<Inner>,
    risk_cfg: RiskConfig,
    exec_cfg: ExecutionConfig,
}

impl PaperExecutor {
    pub fn new(risk_cfg: RiskConfig, exec_cfg: ExecutionConfig) -> Self {
        Self {
            state: RwLock::new(Inner {
                position: Position::flat(),
                entry_bar_id: None,
                entry_price: None,
                filters: None,
            }),
            risk_cfg,
            exec_cfg,
        }
    }

    pub fn position(&self) -> Position {
        self.state.read().position
    }

    pub fn set_filters(&self, filters: SymbolFilters) {
        self.state.write().filters = Some(filters);
    }

    pub fn filters(&self) -> Option<SymbolFilters> {
        self.state.read().filters.clone()
    }

    // -------------------------------------------------------------------------
    // Precision
    // -------------------------------------------------------------------------

    /// Floor `qty` to the exchange step size (sign preserved) and widen up
    /// to min-qty/min-notional if the raw request undershoots them.
    fn clamp_qty(&self, qty: f64, price: f64, filters: &SymbolFilters) -> f64 {
        let sign = if qty < 0.0 { -1.0 } else { 1.0 };
        let mut q = qty.abs();
        if filters.step_size > 0.0 && price > 0.0 {
            let min_notional_qty = filters.min_notional / price.max(1e-9);
            if min_notional_qty > q {
                q = min_notional_qty;
            }
        }
        let step = if filters.step_size > 0.0 { filters.step_size } else { 0.000_001 };
        q = (q / step).floor() * step;
        sign * q
    }

    fn apply_slippage(&self, side: Side, price: f64) -> f64 {
        let bps = self.risk_cfg.slippage_bps.max(0.0);
        if bps <= 0.0 {
            return price;
        }
        let slip = price * (bps / 10_000.0);
        match side {
            Side::Buy => price + slip,
            Side::Sell => price - slip,
            Side::Hold => price,
        }
    }

    /// Apply one simulated fill leg: fee, quadratic impact, weighted-average
    /// price on same-side adds, realized PnL on close, flip-to-new-price on
    /// opposite-side remainder.
    fn simulate_trade(&self, s: &mut Inner, side: Side, qty: f64, price: f64, now_ms: i64) -> FillLeg {
        let signed_trade = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
            Side::Hold => 0.0,
        };
        let old_qty = s.position.qty;
        let new_qty = old_qty + signed_trade;
        let fee = (qty * price).abs() * (self.risk_cfg.cost_bps.max(0.0) / 10_000.0);
        let impact = if self.risk_cfg.impact_k > 0.0 {
            self.risk_cfg.impact_k * qty.powi(2) * price
        } else {
            0.0
        };

        let mut realized = 0.0;
        let same_side_add = old_qty == 0.0 || (old_qty > 0.0 && signed_trade > 0.0) || (old_qty < 0.0 && signed_trade < 0.0);
        if same_side_add {
            let total_qty = old_qty.abs() + qty;
            if total_qty > 0.0 {
                s.position.avg_px = if old_qty == 0.0 {
                    price
                } else {
                    (old_qty.abs() * s.position.avg_px + qty * price) / total_qty
                };
            }
        } else {
            let close_qty = old_qty.abs().min(qty);
            let direction = if old_qty > 0.0 { 1.0 } else { -1.0 };
            realized += close_qty * (price - s.position.avg_px) * direction;
            if new_qty.abs() < 1e-12 {
                s.position.avg_px = 0.0;
            } else if close_qty < qty {
                s.position.avg_px = price;
            }
        }

        s.position.qty = new_qty;
        s.position.realized_pnl += realized - fee - impact;
        if new_qty.abs() < 1e-12 {
            s.entry_bar_id = None;
            s.entry_price = None;
            s.position.opened_at_ms = 0;
        } else if s.entry_price.is_none() {
            s.entry_price = Some(price);
            s.position.opened_at_ms = now_ms;
        }

        FillLeg { qty, price, fee, impact }
    }

    fn update_entry_tracking(&self, s: &mut Inner, old_pos_frac: f64, new_pos_frac: f64, bar_id: u64, price: f64) {
        let opened_or_grew = new_pos_frac.abs() > old_pos_frac.abs() + 1e-9;
        let closed = new_pos_frac.abs() < 1e-9;
        let flipped = (old_pos_frac > 0.0 && new_pos_frac < 0.0) || (old_pos_frac < 0.0 && new_pos_frac > 0.0);
        if closed {
            s.entry_bar_id = None;
            s.entry_price = None;
        } else if opened_or_grew || flipped {
            s.entry_bar_id = Some(bar_id);
            s.entry_price = Some(price);
        }
        s.position.fraction = new_pos_frac;
    }

    // -------------------------------------------------------------------------
    // Forced exits
    // -------------------------------------------------------------------------

    /// Check whether the open position should be force-closed ahead of
    /// applying the model's fresh decision. `direction`/`confidence`/`alpha`
    /// describe the latest (pre-guard) decision.
    pub fn should_force_exit(&self, bar_id: u64, price: f64, direction: i32, confidence: f64, alpha: f64) -> Option<ForcedExitReason> {
        if !self.risk_cfg.enable_forced_exits {
            return None;
        }
        let s = self.state.read();
        let pos = s.position.fraction;
        if pos.abs() < 1e-9 {
            return None;
        }

        if pos > 0.0 && direction < 0 && (confidence >= EXIT_CONF_MIN || alpha >= EXIT_ALPHA_MIN) {
            return Some(ForcedExitReason::ModelReversal);
        }
        if pos < 0.0 && direction > 0 && (confidence >= EXIT_CONF_MIN || alpha >= EXIT_ALPHA_MIN) {
            return Some(ForcedExitReason::ModelReversal);
        }

        if let Some(entry_bar) = s.entry_bar_id {
            if self.risk_cfg.max_position_duration_bars > 0 {
                let held = bar_id.saturating_sub(entry_bar);
                if held >= self.risk_cfg.max_position_duration_bars as u64 {
                    return Some(ForcedExitReason::MaxDuration);
                }
            }
        }

        if let Some(entry_price) = s.entry_price {
            if entry_price > 0.0 && price > 0.0 {
                let pnl_bps = if pos > 0.0 {
                    (price - entry_price) / entry_price * 10_000.0
                } else {
                    (entry_price - price) / entry_price * 10_000.0
                };
                if self.risk_cfg.stop_loss_bps > 0.0 && pnl_bps < -self.risk_cfg.stop_loss_bps {
                    return Some(ForcedExitReason::StopLoss);
                }
                if self.risk_cfg.take_profit_bps > 0.0 && pnl_bps > self.risk_cfg.take_profit_bps {
                    return Some(ForcedExitReason::TakeProfit);
                }
            }
        }

        None
    }

    // -------------------------------------------------------------------------
    // Mirroring
    // -------------------------------------------------------------------------

    /// Resolve `target_pos` (a signed exposure fraction) against ADV cap and
    /// exchange precision, returning the clamped trade quantity and side, or
    /// `None` if the rebalance is below the no-trade band / resolves to ~0 qty.
    fn resolve_trade_qty(&self, target_pos: f64, last_price: f64, adv20_usd: f64, filters: &SymbolFilters, current_frac: f64) -> Option<(Side, f64, f64, f64)> {
        if (target_pos - current_frac).abs() < self.risk_cfg.rebalance_min_pos_delta.max(0.0) {
            return None;
        }
        let base_notional = self.risk_cfg.base_notional.max(1e-6);
        let target_qty = target_pos * base_notional / last_price.max(1e-6);
        let current_qty = current_frac * base_notional / last_price.max(1e-6);
        let delta_qty = target_qty - current_qty;
        if delta_qty.abs() < 1e-9 {
            return None;
        }

        let side = if delta_qty > 0.0 { Side::Buy } else { Side::Sell };
        let mut qty = self.clamp_qty(delta_qty.abs(), last_price, filters);

        if self.risk_cfg.adv_cap_pct > 0.0 && adv20_usd > 0.0 {
            let max_notional = adv20_usd * (self.risk_cfg.adv_cap_pct / 100.0);
            let trade_notional = qty * last_price;
            if trade_notional > max_notional && max_notional > 0.0 {
                qty = max_notional / last_price.max(1e-6);
            }
        }
        if qty <= 0.0 {
            return None;
        }
        Some((side, qty, target_qty, delta_qty))
    }

    /// Market mode: one crossing fill at `last_price ± slippage`.
    pub fn mirror_market(&self, target_pos: f64, last_price: f64, adv20_usd: f64, now_ms: i64, bar_id: u64) -> Option<TradeReport> {
        let filters = self.state.read().filters.clone().unwrap_or(SymbolFilters {
            step_size: 0.000_001,
            tick_size: 0.01,
            min_notional: 0.0,
        });
        let current_frac = self.state.read().position.fraction;
        let (side, qty, target_qty, delta_qty) = self.resolve_trade_qty(target_pos, last_price, adv20_usd, &filters, current_frac)?;

        let mut s = self.state.write();
        let eff_price = self.apply_slippage(side, last_price);
        let pnl_before = s.position.realized_pnl;
        let leg = self.simulate_trade(&mut s, side, qty, eff_price, now_ms);
        self.update_entry_tracking(&mut s, current_frac, target_pos, bar_id, eff_price);
        let realized_delta = s.position.realized_pnl - pnl_before;

        info!(side = %side, qty, price = eff_price, target_pos, "market mirror executed");
        Some(TradeReport {
            side,
            target_qty,
            delta_qty,
            avg_price: leg.price,
            mid_price: last_price,
            passive: None,
            cross: Some(leg),
            total_fee: leg.fee,
            total_impact: leg.impact,
            realized_pnl_delta: realized_delta,
            position: s.position,
        })
    }

    /// Passive-then-cross mode: rest up to 25% of displayed top size at
    /// top-of-book, cross the remainder at `last_price ± slippage`.
    pub fn mirror_passive_then_cross(
        &self,
        target_pos: f64,
        last_price: f64,
        book: BookTicker,
        book_qty: f64,
        adv20_usd: f64,
        now_ms: i64,
        bar_id: u64,
    ) -> Option<TradeReport> {
        let filters = self.state.read().filters.clone().unwrap_or(SymbolFilters {
            step_size: 0.000_001,
            tick_size: 0.01,
            min_notional: 0.0,
        });
        let current_frac = self.state.read().position.fraction;
        let (side, qty, target_qty, delta_qty) = self.resolve_trade_qty(target_pos, last_price, adv20_usd, &filters, current_frac)?;

        let passive_px = match side {
            Side::Buy => book.bid,
            Side::Sell => book.ask,
            Side::Hold => last_price,
        };
        let passive_cap = (0.25 * book_qty.max(0.0)).max(0.0);
        let passive_qty = qty.min(passive_cap);
        let cross_qty = (qty - passive_qty).max(0.0);

        let mut s = self.state.write();
        let pnl_before = s.position.realized_pnl;

        let mut passive_leg = None;
        let mut weighted_numer = 0.0;
        let mut total_exec_qty = 0.0;
        let mut total_fee = 0.0;
        let mut total_impact = 0.0;

        if passive_qty > 1e-12 {
            let leg = self.simulate_trade(&mut s, side, passive_qty, passive_px, now_ms);
            weighted_numer += passive_qty * passive_px;
            total_exec_qty += passive_qty;
            total_fee += leg.fee;
            total_impact += leg.impact;
            passive_leg = Some(leg);
        }

        let mut cross_leg = None;
        if cross_qty > 1e-12 {
            let eff_price = self.apply_slippage(side, last_price);
            let leg = self.simulate_trade(&mut s, side, cross_qty, eff_price, now_ms);
            weighted_numer += cross_qty * eff_price;
            total_exec_qty += cross_qty;
            total_fee += leg.fee;
            total_impact += leg.impact;
            cross_leg = Some(leg);
        }

        self.update_entry_tracking(&mut s, current_frac, target_pos, bar_id, last_price);
        let realized_delta = s.position.realized_pnl - pnl_before;
        let avg_price = if total_exec_qty > 0.0 { weighted_numer / total_exec_qty } else { last_price };

        debug!(side = %side, passive_qty, cross_qty, avg_price, "passive-then-cross mirror executed");
        Some(TradeReport {
            side,
            target_qty,
            delta_qty,
            avg_price,
            mid_price: last_price,
            passive: passive_leg,
            cross: cross_leg,
            total_fee,
            total_impact,
            realized_pnl_delta: realized_delta,
            position: s.position,
        })
    }

    /// Dispatch to the configured execution mode.
    pub fn mirror(
        &self,
        target_pos: f64,
        last_price: f64,
        book: BookTicker,
        book_qty: f64,
        adv20_usd: f64,
        now_ms: i64,
        bar_id: u64,
    ) -> Option<TradeReport> {
        match self.exec_cfg.mode {
            crate::types::ExecutionMode::Market => self.mirror_market(target_pos, last_price, adv20_usd, now_ms, bar_id),
            crate::types::ExecutionMode::PassiveThenCross => {
                self.mirror_passive_then_cross(target_pos, last_price, book, book_qty, adv20_usd, now_ms, bar_id)
            }
        }
    }
}

impl std::fmt::Debug for PaperExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("PaperExecutor")
            .field("mode", &self.exec_cfg.mode)
            .field("position", &s.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk_cfg() -> RiskConfig {
        RiskConfig {
            sigma_target: 0.2,
            pos_max: 1.0,
            cooldown_bars: 1,
            bar_minutes: 5.0,
            realized_vol_window: 50,
            base_notional: 10_000.0,
            vol_floor: 0.2,
            adv_cap_pct: 0.0,
            rebalance_min_pos_delta: 0.0,
            daily_stop_dd_pct: 0.05,
            warmup_skip_bars: 0,
            cost_bps: 5.0,
            slippage_bps: 10.0,
            impact_k: 0.0,
            max_impact_bps_hard: 200.0,
            enable_net_edge_gating: true,
            min_net_edge_bps: 10.0,
            max_total_cost_bps: 25.0,
            enable_forced_exits: true,
            max_position_duration_bars: 10,
            stop_loss_bps: 100.0,
            take_profit_bps: 100.0,
        }
    }

    fn filters() -> SymbolFilters {
        SymbolFilters { step_size: 0.0001, tick_size: 0.01, min_notional: 5.0 }
    }

    #[test]
    fn market_mirror_opens_long_position() {
        let exec = PaperExecutor::new(risk_cfg(), ExecutionConfig::default());
        exec.set_filters(filters());
        let report = exec.mirror_market(0.5, 100.0, 0.0, 1_000, 1).expect("should trade");
        assert_eq!(report.side, Side::Buy);
        assert!(exec.position().qty > 0.0);
    }

    #[test]
    fn same_side_add_updates_weighted_average_price() {
        let exec = PaperExecutor::new(risk_cfg(), ExecutionConfig::default());
        exec.set_filters(filters());
        exec.mirror_market(0.3, 100.0, 0.0, 1_000, 1).unwrap();
        let px1 = exec.position().avg_px;
        exec.mirror_market(0.6, 110.0, 0.0, 2_000, 2).unwrap();
        let px2 = exec.position().avg_px;
        assert!(px2 > px1);
    }

    #[test]
    fn closing_a_position_realizes_pnl() {
        let exec = PaperExecutor::new(risk_cfg(), ExecutionConfig::default());
        exec.set_filters(filters());
        exec.mirror_market(0.5, 100.0, 0.0, 1_000, 1).unwrap();
        let report = exec.mirror_market(0.0, 120.0, 0.0, 2_000, 2).unwrap();
        assert!(report.realized_pnl_delta > 0.0);
    }

    #[test]
    fn full_close_resets_avg_px() {
        let exec = PaperExecutor::new(risk_cfg(), ExecutionConfig::default());
        exec.set_filters(filters());
        exec.mirror_market(0.5, 100.0, 0.0, 1_000, 1).unwrap();
        assert!(exec.position().avg_px > 0.0);
        exec.mirror_market(0.0, 120.0, 0.0, 2_000, 2).unwrap();
        assert_eq!(exec.position().qty, 0.0);
        assert_eq!(exec.position().avg_px, 0.0);
    }

    #[test]
    fn forced_exit_on_max_duration() {
        let exec = PaperExecutor::new(risk_cfg(), ExecutionConfig::default());
        exec.set_filters(filters());
        exec.mirror_market(0.5, 100.0, 0.0, 1_000, 1).unwrap();
        let reason = exec.should_force_exit(20, 100.0, 1, 0.1, 0.1);
        assert_eq!(reason, Some(ForcedExitReason::MaxDuration));
    }

    #[test]
    fn forced_exit_on_stop_loss() {
        let exec = PaperExecutor::new(risk_cfg(), ExecutionConfig::default());
        exec.set_filters(filters());
        exec.mirror_market(0.5, 100.0, 0.0, 1_000, 1).unwrap();
        let reason = exec.should_force_exit(2, 85.0, 1, 0.0, 0.0);
        assert_eq!(reason, Some(ForcedExitReason::StopLoss));
    }

    #[test]
    fn passive_then_cross_splits_legs() {
        let exec = PaperExecutor::new(risk_cfg(), ExecutionConfig::default());
        exec.set_filters(filters());
        let book = BookTicker { bid: 99.9, ask: 100.1 };
        let report = exec.mirror_passive_then_cross(0.5, 100.0, book, 1000.0, 0.0, 1_000, 1).unwrap();
        assert!(report.passive.is_some());
    }
}

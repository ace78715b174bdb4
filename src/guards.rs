// =============================================================================
// Pre-trade Guard Chain — ordered veto pipeline with reason codes
// =============================================================================
//
// Eleven guards run in a fixed order; the first that fires wins and the
// decision is neutralized (direction=0, alpha=0) while preserving the prior
// `details` and carrying diagnostics. Guards only run when `dir != 0`, which
// makes the chain trivially idempotent: a neutralized decision has `dir=0`
// and re-running the chain on it is a no-op.
//
// Each guard is a pure function over `GuardContext` — no exceptions, no
// shared mutable state, no per-guard error handling.
//
// The impact estimate is a single quadratic formula, used consistently for
// both the soft-cap and hard-veto guards and for net-edge gating (see
// DESIGN.md).
// =============================================================================

use std::collections::BTreeMap;

use crate::config::{CalibrationConfig, MicrostructureConfig, RiskConfig, RiskControlsConfig};
use crate::data_model::Decision;
use crate::reason_codes::GuardReasonCode;

/// Market/account context the guard chain needs, gathered by the driver
/// before invoking `run_guard_chain`.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext {
    pub now_ms: i64,
    pub spread_bps: f64,
    pub funding_rate: f64,
    pub price: f64,
    /// Predicted/calibrated signal magnitude in bps (used by net-edge gating
    /// and the calibration-band guard).
    pub signal_bps: f64,
    pub current_pos: f64,
    /// Target position fraction, pre-computed by the vol-targeted sizing
    /// formula (pure function of direction/alpha/realized-vol) ahead of the
    /// guard chain so guard #4's delta-pi check and the impact estimate can
    /// use the same number the executor will eventually trade toward.
    pub target_pos: f64,
    pub adv20_usd: f64,
    /// `(ts_ms, sign)` of the last executed sign flip, if any.
    pub last_flip: Option<(i64, i32)>,
    pub orders_in_last_second: u32,
    pub exec_notional_last_hour: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GuardDetails(pub BTreeMap<String, f64>);

impl GuardDetails {
    fn new() -> Self {
        Self(BTreeMap::new())
    }

    fn with(mut self, key: &str, value: f64) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }
}

pub enum GuardOutcome {
    Pass,
    Veto(GuardReasonCode, GuardDetails),
}

/// `impact_bps = impact_k * qty^2 * price / notional * 10000`, where
/// `notional = |delta_pi| * base_notional` and `qty = notional / price`.
pub fn estimate_impact(delta_pi: f64, base_notional: f64, price: f64, impact_k: f64) -> (f64, f64) {
    let notional = delta_pi.abs() * base_notional;
    if price <= 0.0 || notional <= 0.0 {
        return (notional, 0.0);
    }
    let qty = notional / price;
    let impact_bps = impact_k * qty * qty * price / notional * 10_000.0;
    (notional, impact_bps)
}

fn guard_spread(ctx: &GuardContext, cfg: &MicrostructureConfig) -> GuardOutcome {
    if !cfg.enable {
        return GuardOutcome::Pass;
    }
    if ctx.spread_bps > cfg.max_spread_bps {
        return GuardOutcome::Veto(
            GuardReasonCode::SpreadGuard,
            GuardDetails::new()
                .with("spread_bps", ctx.spread_bps)
                .with("max_spread_bps", cfg.max_spread_bps),
        );
    }
    GuardOutcome::Pass
}

fn guard_funding(dir: i32, ctx: &GuardContext, cfg: &RiskControlsConfig) -> GuardOutcome {
    if ctx.funding_rate.abs() > cfg.funding_guard_bias && ctx.funding_rate.signum() as i32 == dir {
        return GuardOutcome::Veto(
            GuardReasonCode::FundingGuard,
            GuardDetails::new()
                .with("funding_rate", ctx.funding_rate)
                .with("funding_guard_bias", cfg.funding_guard_bias),
        );
    }
    GuardOutcome::Pass
}

fn guard_min_sign_flip(dir: i32, ctx: &GuardContext, cfg: &RiskControlsConfig) -> GuardOutcome {
    if let Some((ts, sign)) = ctx.last_flip {
        let gap_ms = (cfg.min_sign_flip_gap_s * 1000.0) as i64;
        if dir != sign && (ctx.now_ms - ts) < gap_ms {
            return GuardOutcome::Veto(
                GuardReasonCode::MinSignFlip,
                GuardDetails::new()
                    .with("elapsed_ms", (ctx.now_ms - ts) as f64)
                    .with("gap_ms", gap_ms as f64),
            );
        }
    }
    GuardOutcome::Pass
}

fn guard_delta_pi_min(ctx: &GuardContext, cfg: &RiskControlsConfig) -> GuardOutcome {
    let delta_pi = (ctx.target_pos - ctx.current_pos).abs();
    let min_delta = cfg.delta_pi_min_bps / 10_000.0;
    if delta_pi < min_delta {
        return GuardOutcome::Veto(
            GuardReasonCode::DeltaPiMin,
            GuardDetails::new()
                .with("delta_pi", delta_pi)
                .with("min_delta_pi", min_delta),
        );
    }
    GuardOutcome::Pass
}

fn guard_impact_soft(impact_bps: f64, cfg: &RiskControlsConfig) -> GuardOutcome {
    if impact_bps > cfg.max_impact_bps {
        return GuardOutcome::Veto(
            GuardReasonCode::ImpactGuard,
            GuardDetails::new()
                .with("impact_bps_est", impact_bps)
                .with("max_impact_bps", cfg.max_impact_bps),
        );
    }
    GuardOutcome::Pass
}

fn guard_impact_hard(impact_bps: f64, cfg: &RiskConfig) -> GuardOutcome {
    if impact_bps > cfg.max_impact_bps_hard {
        return GuardOutcome::Veto(
            GuardReasonCode::ImpactCritical,
            GuardDetails::new()
                .with("impact_bps_est", impact_bps)
                .with("max_impact_bps_hard", cfg.max_impact_bps_hard),
        );
    }
    GuardOutcome::Pass
}

fn guard_net_edge(ctx: &GuardContext, impact_bps: f64, cfg: &RiskConfig) -> GuardOutcome {
    if !cfg.enable_net_edge_gating {
        return GuardOutcome::Pass;
    }
    let total_cost = cfg.cost_bps + cfg.slippage_bps + impact_bps;
    let net_edge = ctx.signal_bps.abs() - total_cost;
    if net_edge < cfg.min_net_edge_bps {
        return GuardOutcome::Veto(
            GuardReasonCode::NetEdgeInsufficient,
            GuardDetails::new()
                .with("net_edge_bps", net_edge)
                .with("min_net_edge_bps", cfg.min_net_edge_bps)
                .with("total_cost_bps", total_cost),
        );
    }
    GuardOutcome::Pass
}

fn guard_throttle(ctx: &GuardContext, cfg: &RiskControlsConfig) -> GuardOutcome {
    if ctx.orders_in_last_second >= cfg.max_orders_per_sec {
        return GuardOutcome::Veto(
            GuardReasonCode::ThrottleGuard,
            GuardDetails::new()
                .with("orders_in_last_second", ctx.orders_in_last_second as f64)
                .with("max_orders_per_sec", cfg.max_orders_per_sec as f64),
        );
    }
    GuardOutcome::Pass
}

fn guard_adv_order(notional: f64, ctx: &GuardContext, cfg: &RiskControlsConfig) -> GuardOutcome {
    let cap = cfg.adv_order_cap * ctx.adv20_usd;
    if notional > cap {
        return GuardOutcome::Veto(
            GuardReasonCode::AdvOrderCap,
            GuardDetails::new()
                .with("est_notional", notional)
                .with("adv_order_cap_usd", cap),
        );
    }
    GuardOutcome::Pass
}

fn guard_adv_hour(notional: f64, ctx: &GuardContext, cfg: &RiskControlsConfig) -> GuardOutcome {
    let cap = cfg.adv_hour_cap * ctx.adv20_usd;
    let projected = ctx.exec_notional_last_hour + notional;
    if projected > cap {
        return GuardOutcome::Veto(
            GuardReasonCode::AdvHourCap,
            GuardDetails::new()
                .with("projected_hour_notional", projected)
                .with("adv_hour_cap_usd", cap),
        );
    }
    GuardOutcome::Pass
}

fn guard_calibration_band(ctx: &GuardContext, cfg: &CalibrationConfig) -> GuardOutcome {
    if ctx.signal_bps.abs() <= cfg.band_bps {
        return GuardOutcome::Veto(
            GuardReasonCode::CalibrationBandGate,
            GuardDetails::new()
                .with("pred_cal_bps", ctx.signal_bps)
                .with("band_bps", cfg.band_bps),
        );
    }
    GuardOutcome::Pass
}

/// Run all eleven guards in order against `decision`. Returns the (possibly
/// neutralized) decision plus the reason-code pass/fail map and diagnostic
/// details recorded for the `order_intent` log stream.
pub fn run_guard_chain(
    decision: &Decision,
    ctx: &GuardContext,
    microstructure: &MicrostructureConfig,
    risk_controls: &RiskControlsConfig,
    risk: &RiskConfig,
    calibration: &CalibrationConfig,
) -> (Decision, BTreeMap<String, bool>, Option<GuardDetails>) {
    let mut reason_codes = BTreeMap::new();
    let all_codes = [
        GuardReasonCode::SpreadGuard,
        GuardReasonCode::FundingGuard,
        GuardReasonCode::MinSignFlip,
        GuardReasonCode::DeltaPiMin,
        GuardReasonCode::ImpactGuard,
        GuardReasonCode::ImpactCritical,
        GuardReasonCode::NetEdgeInsufficient,
        GuardReasonCode::ThrottleGuard,
        GuardReasonCode::AdvOrderCap,
        GuardReasonCode::AdvHourCap,
        GuardReasonCode::CalibrationBandGate,
    ];
    for code in all_codes {
        reason_codes.insert(code.to_string(), true);
    }

    if decision.direction == 0 {
        return (decision.clone(), reason_codes, None);
    }

    let (notional, impact_bps) =
        estimate_impact(ctx.target_pos - ctx.current_pos, risk.base_notional, ctx.price, risk.impact_k);

    let checks: [(GuardReasonCode, GuardOutcome); 11] = [
        (GuardReasonCode::SpreadGuard, guard_spread(ctx, microstructure)),
        (GuardReasonCode::FundingGuard, guard_funding(decision.direction, ctx, risk_controls)),
        (
            GuardReasonCode::MinSignFlip,
            guard_min_sign_flip(decision.direction, ctx, risk_controls),
        ),
        (GuardReasonCode::DeltaPiMin, guard_delta_pi_min(ctx, risk_controls)),
        (GuardReasonCode::ImpactGuard, guard_impact_soft(impact_bps, risk_controls)),
        (GuardReasonCode::ImpactCritical, guard_impact_hard(impact_bps, risk)),
        (GuardReasonCode::NetEdgeInsufficient, guard_net_edge(ctx, impact_bps, risk)),
        (GuardReasonCode::ThrottleGuard, guard_throttle(ctx, risk_controls)),
        (GuardReasonCode::AdvOrderCap, guard_adv_order(notional, ctx, risk_controls)),
        (GuardReasonCode::AdvHourCap, guard_adv_hour(notional, ctx, risk_controls)),
        (GuardReasonCode::CalibrationBandGate, guard_calibration_band(ctx, calibration)),
    ];

    for (code, outcome) in checks {
        match outcome {
            GuardOutcome::Pass => {}
            GuardOutcome::Veto(reason, mut details) => {
                reason_codes.insert(code.to_string(), false);
                details.0.insert("est_notional".to_string(), notional);
                details.0.insert("impact_bps_est".to_string(), impact_bps);
                let mut neutralized = decision.clone();
                neutralized.direction = 0;
                neutralized.alpha = 0.0;
                neutralized.mode = reason.to_string();
                return (neutralized, reason_codes, Some(details));
            }
        }
    }

    (decision.clone(), reason_codes, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(dir: i32) -> Decision {
        let mut d = Decision::neutral("agreement");
        d.direction = dir;
        d.alpha = 0.8;
        d
    }

    fn ctx() -> GuardContext {
        GuardContext {
            now_ms: 1_000_000,
            spread_bps: 1.0,
            funding_rate: 0.0,
            price: 50_000.0,
            signal_bps: 20.0,
            current_pos: 0.0,
            target_pos: 0.1,
            adv20_usd: 1_000_000_000.0,
            last_flip: None,
            orders_in_last_second: 0,
            exec_notional_last_hour: 0.0,
        }
    }

    fn risk_cfg() -> RiskConfig {
        crate::config::RiskConfig::default()
    }

    #[test]
    fn impact_hard_veto_scenario() {
        let d = decision(1);
        let mut c = ctx();
        c.current_pos = 0.0;
        c.target_pos = 0.8; // delta_pi=0.8, base_notional=10000 -> notional=8000, qty=0.16
        let mut risk = risk_cfg();
        risk.impact_k = 0.2; // impact_bps = impact_k * qty * 10000 = 0.2 * 0.16 * 10000 = 320
        risk.base_notional = 10_000.0;
        risk.max_impact_bps_hard = 200.0;
        // Raise the soft cap above the hard one so the soft guard (which
        // runs first) passes and the scenario actually reaches the hard
        // veto instead of being vetoed earlier by the soft cap.
        let mut rc = RiskControlsConfig::default();
        rc.max_impact_bps = 1_000.0;
        let (out, _codes, details) = run_guard_chain(
            &d,
            &c,
            &MicrostructureConfig::default(),
            &rc,
            &risk,
            &CalibrationConfig::default(),
        );
        assert_eq!(out.direction, 0);
        assert_eq!(out.mode, "impact_critical");
        let details = details.unwrap();
        assert!(details.0["impact_bps_est"] > 200.0);
    }

    #[test]
    fn net_edge_insufficient_scenario() {
        let mut d = decision(1);
        d.alpha = 0.001;
        let mut c = ctx();
        c.signal_bps = 10.0;
        c.target_pos = 0.0001;
        let mut risk = risk_cfg();
        risk.cost_bps = 5.0;
        risk.slippage_bps = 2.0;
        risk.impact_k = 0.0;
        risk.min_net_edge_bps = 10.0;
        risk.max_impact_bps_hard = 1_000_000.0;
        let mut rc = RiskControlsConfig::default();
        rc.max_impact_bps = 1_000_000.0;
        rc.delta_pi_min_bps = 0.0;
        let (out, _codes, details) = run_guard_chain(
            &d,
            &c,
            &MicrostructureConfig::default(),
            &rc,
            &risk,
            &CalibrationConfig::default(),
        );
        assert_eq!(out.mode, "net_edge_insufficient");
        let details = details.unwrap();
        // total_cost = cost_bps(5.0) + slippage_bps(2.0) + impact_bps(0.0) = 7.0
        // net_edge = signal_bps(10.0) - 7.0 = 3.0, still below min_net_edge_bps(10.0)
        assert!((details.0["net_edge_bps"] - 3.0).abs() < 1e-9);
    }

    /// Spec §8 Scenario 5, literal inputs: `alpha=0.001` (10 bps signal),
    /// `cost_bps=5, slippage_bps=2, impact_bps_est=2, min_net_edge_bps=10`
    /// => neutral with `mode=net_edge_insufficient` and `net_edge_bps = 1`.
    #[test]
    fn net_edge_insufficient_spec_scenario_5_literal_values() {
        let mut d = decision(1);
        d.alpha = 0.001;
        let mut c = ctx();
        c.signal_bps = 10.0;
        c.target_pos = 0.0001;
        let mut risk = risk_cfg();
        risk.cost_bps = 5.0;
        risk.slippage_bps = 2.0;
        // impact_k chosen so `estimate_impact` yields exactly impact_bps=2
        // at price=50_000, base_notional=10_000, delta_pi=0.0001 (see ctx()).
        risk.impact_k = 10.0;
        risk.min_net_edge_bps = 10.0;
        risk.max_impact_bps_hard = 1_000.0;
        let mut rc = RiskControlsConfig::default();
        rc.max_impact_bps = 1_000.0;
        rc.delta_pi_min_bps = 0.0;
        let (out, _codes, details) = run_guard_chain(
            &d,
            &c,
            &MicrostructureConfig::default(),
            &rc,
            &risk,
            &CalibrationConfig::default(),
        );
        assert_eq!(out.direction, 0);
        assert_eq!(out.mode, "net_edge_insufficient");
        let details = details.unwrap();
        assert!((details.0["impact_bps_est"] - 2.0).abs() < 1e-9);
        assert!((details.0["net_edge_bps"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn guard_chain_is_idempotent() {
        let d = decision(1);
        let c = ctx();
        let (out1, _, _) = run_guard_chain(
            &d,
            &c,
            &MicrostructureConfig::default(),
            &RiskControlsConfig::default(),
            &risk_cfg(),
            &CalibrationConfig::default(),
        );
        let (out2, _, _) = run_guard_chain(
            &out1,
            &c,
            &MicrostructureConfig::default(),
            &RiskControlsConfig::default(),
            &risk_cfg(),
            &CalibrationConfig::default(),
        );
        assert_eq!(out1.direction, out2.direction);
        assert_eq!(out1.mode, out2.mode);
    }

    #[test]
    fn calibration_band_boundary_is_in_band() {
        let d = decision(1);
        let mut c = ctx();
        c.signal_bps = 5.0;
        c.target_pos = 0.0;
        let cal = CalibrationConfig { band_bps: 5.0 };
        let mut rc = RiskControlsConfig::default();
        rc.delta_pi_min_bps = 0.0;
        let (out, _, _) = run_guard_chain(
            &d,
            &c,
            &MicrostructureConfig::default(),
            &rc,
            &risk_cfg(),
            &cal,
        );
        assert_eq!(out.mode, "calibration_band_gate");
    }
}

// =============================================================================
// Signal Combiner — deterministic multi-timeframe alignment rules
// =============================================================================
//
// Applies the alignment rules in priority order with a short-circuit on the
// first match: conflict-skip, agreement, neutral-override, weighted-average,
// majority-vote fallback. Post-adjustments (halve-on-1h-opposition,
// conflict-band-skip) then run on the winning combined signal.
//
// Majority-vote ties resolve to the largest key's direction: `+1` beats `0`
// beats `-1`. This is an explicit, deterministic tie-break rule.
// =============================================================================

use std::collections::BTreeMap;

use crate::config::AlignmentConfig;
use crate::data_model::{Decision, Signal};

/// Which rule produced the combined decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentRule {
    ConflictSkip,
    Agreement,
    NeutralOverride,
    WeightedAverage,
    MajorityVote,
}

impl AlignmentRule {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::ConflictSkip => "conflict_skip",
            Self::Agreement => "agreement",
            Self::NeutralOverride => "weighted_average",
            Self::WeightedAverage => "weighted_average",
            Self::MajorityVote => "majority_vote",
        }
    }
}

/// Inputs needed by the combiner beyond the per-timeframe signals.
pub struct CombinerInputs<'a> {
    /// Per-timeframe signals, keyed by timeframe name (e.g. "5m", "15m", "1h").
    pub signals: &'a BTreeMap<String, Signal>,
    /// Weights used for the weighted-average and majority-vote rules.
    /// Timeframes absent from this map default to weight `1.0`.
    pub weights: &'a BTreeMap<String, f64>,
    /// Timeframes that must all agree for the `Agreement` rule to fire.
    pub required: &'a [String],
    /// The designated override timeframe (e.g. "1h"), if any.
    pub override_tf: Option<&'a str>,
    /// Calibrated prediction magnitude in bps, used by `conflict_band_skip`.
    pub pred_cal_bps: f64,
    /// The calibration band, in bps.
    pub band_bps: f64,
    /// Alignment thresholds (`conflict_min_alpha`, `conflict_band_mult`, ...).
    pub alignment_cfg: &'a AlignmentConfig,
}

fn weight_of(weights: &BTreeMap<String, f64>, tf: &str) -> f64 {
    weights.get(tf).copied().unwrap_or(1.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Combine per-timeframe signals into a single decision, then apply the
/// halve-on-1h-opposition and conflict-band-skip post-adjustments.
pub fn combine_signals(inputs: &CombinerInputs) -> Decision {
    let signals = inputs.signals;

    if signals.is_empty() {
        return Decision::neutral("no_signals");
    }

    let five_m = signals.get("5m");
    let fifteen_m = signals.get("15m");

    // 1. Conflict skip.
    if let (Some(a), Some(b)) = (five_m, fifteen_m) {
        if a.direction != 0 && b.direction != 0 && a.direction != b.direction {
            let max_alpha = a.alpha.max(b.alpha);
            if max_alpha < inputs.conflict_min_alpha() {
                return Decision::neutral(AlignmentRule::ConflictSkip.mode());
            }
        }
    }

    // 2. Agreement across all required timeframes.
    if !inputs.required.is_empty() {
        let mut agree = true;
        let mut sign = 0i32;
        let mut alphas = Vec::new();
        let mut confs = Vec::new();
        for tf in inputs.required {
            match signals.get(tf) {
                Some(s) if s.direction != 0 => {
                    if sign == 0 {
                        sign = s.direction;
                    } else if sign != s.direction {
                        agree = false;
                        break;
                    }
                    alphas.push(s.alpha);
                    confs.push(s.confidence);
                }
                _ => {
                    agree = false;
                    break;
                }
            }
        }
        if agree && sign != 0 {
            let mut decision = Decision::neutral(AlignmentRule::Agreement.mode());
            decision.direction = sign;
            decision.alpha = mean(&alphas);
            decision
                .overlay
                .insert("confidence".to_string(), mean(&confs));
            return apply_post_adjustments(decision, inputs);
        }
    }

    // 3. Neutral override: delegate to weighted average of the *other*
    // timeframes when the designated override timeframe is weak.
    let delegate_to_weighted = match inputs.override_tf.and_then(|tf| signals.get(tf)) {
        Some(s) => s.alpha.abs() < inputs.conflict_min_alpha(),
        None => true,
    };

    if delegate_to_weighted {
        let others: BTreeMap<String, Signal> = signals
            .iter()
            .filter(|(tf, _)| Some(tf.as_str()) != inputs.override_tf)
            .map(|(tf, s)| (tf.clone(), *s))
            .collect();
        if !others.is_empty() {
            let decision = weighted_average(&others, inputs.weights, AlignmentRule::NeutralOverride);
            if decision.direction != 0 {
                return apply_post_adjustments(decision, inputs);
            }
        }
    }

    // 4. Weighted average over all available timeframes.
    let decision = weighted_average(signals, inputs.weights, AlignmentRule::WeightedAverage);
    if decision.direction != 0 {
        return apply_post_adjustments(decision, inputs);
    }

    // 5. Majority vote fallback.
    let decision = majority_vote(signals);
    apply_post_adjustments(decision, inputs)
}

fn weighted_average(
    signals: &BTreeMap<String, Signal>,
    weights: &BTreeMap<String, f64>,
    rule: AlignmentRule,
) -> Decision {
    let mut weighted_dir = 0.0;
    let mut weighted_alpha = 0.0;
    let mut weighted_conf = 0.0;
    let mut total_weight = 0.0;

    for (tf, s) in signals.iter() {
        let w = weight_of(weights, tf);
        weighted_dir += w * s.direction as f64;
        weighted_alpha += w * s.alpha;
        weighted_conf += w * s.confidence;
        total_weight += w;
    }

    if total_weight <= 0.0 {
        return Decision::neutral(rule.mode());
    }

    let dir_avg = weighted_dir / total_weight;
    let direction = if dir_avg.abs() < 1e-9 {
        0
    } else {
        dir_avg.signum() as i32
    };

    let mut decision = Decision::neutral(rule.mode());
    decision.direction = direction;
    decision.alpha = (weighted_alpha / total_weight).clamp(0.0, 1.0);
    decision
        .overlay
        .insert("confidence".to_string(), (weighted_conf / total_weight).clamp(0.0, 1.0));
    decision
}

fn majority_vote(signals: &BTreeMap<String, Signal>) -> Decision {
    let mut counts: BTreeMap<i32, u32> = BTreeMap::new();
    for s in signals.values() {
        *counts.entry(s.direction).or_insert(0) += 1;
    }

    // Tie-break: largest key wins (+1 > 0 > -1).
    let mut best_dir = -1;
    let mut best_count = 0u32;
    for dir in [1, 0, -1] {
        let count = counts.get(&dir).copied().unwrap_or(0);
        if count > best_count {
            best_count = count;
            best_dir = dir;
        }
    }

    let alphas: Vec<f64> = signals
        .values()
        .filter(|s| s.direction == best_dir)
        .map(|s| s.alpha)
        .collect();
    let confs: Vec<f64> = signals
        .values()
        .filter(|s| s.direction == best_dir)
        .map(|s| s.confidence)
        .collect();

    let mut decision = Decision::neutral(AlignmentRule::MajorityVote.mode());
    decision.direction = best_dir;
    decision.alpha = mean(&alphas);
    decision
        .overlay
        .insert("confidence".to_string(), mean(&confs));
    decision
}

fn apply_post_adjustments(mut decision: Decision, inputs: &CombinerInputs) -> Decision {
    // Halve on 1h opposition.
    if let Some(one_h) = inputs.signals.get("1h") {
        if one_h.direction != 0 && decision.direction != 0 && one_h.direction != decision.direction {
            decision.alpha *= 0.5;
            decision.overlay.insert("halved_on_1h_opposition".to_string(), 1.0);
        }
    }

    // Conflict band skip: 5m opposes 15m.
    if let (Some(a), Some(b)) = (inputs.signals.get("5m"), inputs.signals.get("15m")) {
        if a.direction != 0 && b.direction != 0 && a.direction != b.direction {
            let threshold = inputs.conflict_band_mult() * inputs.band_bps;
            if inputs.pred_cal_bps.abs() <= threshold {
                return Decision::neutral("conflict_band_skip");
            }
        }
    }

    decision
}

impl<'a> CombinerInputs<'a> {
    fn conflict_min_alpha(&self) -> f64 {
        self.alignment_cfg.conflict_min_alpha
    }

    fn conflict_band_mult(&self) -> f64 {
        self.alignment_cfg.conflict_band_mult
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(direction: i32, alpha: f64, confidence: f64) -> Signal {
        Signal {
            direction,
            alpha,
            confidence,
            bar_id: 1,
        }
    }

    fn alignment_cfg() -> AlignmentConfig {
        AlignmentConfig {
            require_5m_15m_agreement: true,
            allow_1h_override: true,
            halve_on_1h_opposition: true,
            conflict_band_mult: 1.0,
            conflict_min_alpha: 0.3,
        }
    }

    #[test]
    fn scenario_agreement_combine() {
        let mut signals = BTreeMap::new();
        signals.insert("5m".to_string(), sig(1, 0.6, 0.7));
        signals.insert("15m".to_string(), sig(1, 0.4, 0.6));
        let cfg = alignment_cfg();
        let inputs = CombinerInputs {
            signals: &signals,
            weights: &BTreeMap::new(),
            required: &["5m".to_string(), "15m".to_string()],
            override_tf: None,
            pred_cal_bps: 0.0,
            band_bps: 5.0,
            alignment_cfg: &cfg,
        };
        let decision = combine_signals(&inputs);
        assert_eq!(decision.direction, 1);
        assert!((decision.alpha - 0.5).abs() < 1e-9);
        assert_eq!(decision.mode, "agreement");
    }

    #[test]
    fn scenario_halve_on_1h_opposition() {
        let mut signals = BTreeMap::new();
        signals.insert("5m".to_string(), sig(1, 0.6, 0.7));
        signals.insert("15m".to_string(), sig(1, 0.4, 0.6));
        signals.insert("1h".to_string(), sig(-1, 0.3, 0.5));
        let cfg = alignment_cfg();
        let inputs = CombinerInputs {
            signals: &signals,
            weights: &BTreeMap::new(),
            required: &["5m".to_string(), "15m".to_string()],
            override_tf: None,
            pred_cal_bps: 0.0,
            band_bps: 5.0,
            alignment_cfg: &cfg,
        };
        let decision = combine_signals(&inputs);
        assert_eq!(decision.direction, 1);
        assert!((decision.alpha - 0.25).abs() < 1e-9);
    }

    #[test]
    fn scenario_conflict_skip() {
        let mut signals = BTreeMap::new();
        signals.insert("5m".to_string(), sig(1, 0.15, 0.5));
        signals.insert("15m".to_string(), sig(-1, 0.2, 0.5));
        let cfg = alignment_cfg();
        let inputs = CombinerInputs {
            signals: &signals,
            weights: &BTreeMap::new(),
            required: &["5m".to_string(), "15m".to_string()],
            override_tf: None,
            pred_cal_bps: 0.0,
            band_bps: 5.0,
            alignment_cfg: &cfg,
        };
        let decision = combine_signals(&inputs);
        assert_eq!(decision.direction, 0);
        assert_eq!(decision.mode, "conflict_skip");
    }

    #[test]
    fn majority_vote_tie_breaks_to_largest_key() {
        let mut signals = BTreeMap::new();
        signals.insert("a".to_string(), sig(1, 0.1, 0.5));
        signals.insert("b".to_string(), sig(-1, 0.1, 0.5));
        let decision = majority_vote(&signals);
        assert_eq!(decision.direction, 1);
    }

    #[test]
    fn combine_signals_is_deterministic() {
        let mut signals = BTreeMap::new();
        signals.insert("5m".to_string(), sig(1, 0.6, 0.7));
        signals.insert("15m".to_string(), sig(1, 0.4, 0.6));
        let cfg = alignment_cfg();
        let inputs = CombinerInputs {
            signals: &signals,
            weights: &BTreeMap::new(),
            required: &["5m".to_string(), "15m".to_string()],
            override_tf: None,
            pred_cal_bps: 0.0,
            band_bps: 5.0,
            alignment_cfg: &cfg,
        };
        let a = combine_signals(&inputs);
        let b = combine_signals(&inputs);
        assert_eq!(a.direction, b.direction);
        assert!((a.alpha - b.alpha).abs() < 1e-12);
    }
}

// =============================================================================
// Ensemble BMA Blender — online IC/vol-weighted blend of two prediction streams
// =============================================================================
//
// Maintains two aligned rolling histories, `base` (meta-classifier score)
// and `prob` (p_up - p_down), against realized forward returns. Rolling IC
// (Pearson correlation over the trailing `ic_window_bars`) and rolling vol
// (population std-dev over the same window) are recomputed on every push
// unless `freeze=true`, in which case the last computed weights are held.
// Weights are a softmax-like function of `kappa * ic / vol`, so a stream with
// a stronger recent correlation to realized returns and lower recent
// volatility earns more blend weight.
// =============================================================================

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default)]
pub struct BmaWeights {
    pub w_base: f64,
    pub w_prob: f64,
}

pub struct BmaBlender {
    window: usize,
    kappa: f64,
    freeze: bool,
    base_hist: VecDeque<f64>,
    prob_hist: VecDeque<f64>,
    realized_hist: VecDeque<f64>,
    weights: BmaWeights,
}

impl BmaBlender {
    pub fn new(window_bars: u32, kappa: f64, freeze: bool) -> Self {
        Self {
            window: window_bars.max(2) as usize,
            kappa,
            freeze,
            base_hist: VecDeque::new(),
            prob_hist: VecDeque::new(),
            realized_hist: VecDeque::new(),
            weights: BmaWeights {
                w_base: 0.5,
                w_prob: 0.5,
            },
        }
    }

    pub fn set_freeze(&mut self, freeze: bool) {
        self.freeze = freeze;
    }

    /// Push one bar's aligned `(base_pred, prob_pred, realized_return)` and
    /// recompute weights (unless frozen). `realized_return` is the forward
    /// return over the bar just completed, aligned with the predictions made
    /// at the start of that bar.
    pub fn push(&mut self, base_pred: f64, prob_pred: f64, realized_return: f64) {
        self.base_hist.push_back(base_pred);
        self.prob_hist.push_back(prob_pred);
        self.realized_hist.push_back(realized_return);
        while self.base_hist.len() > self.window {
            self.base_hist.pop_front();
            self.prob_hist.pop_front();
            self.realized_hist.pop_front();
        }

        if self.freeze {
            return;
        }

        let ic_base = rolling_ic(&self.base_hist, &self.realized_hist);
        let ic_prob = rolling_ic(&self.prob_hist, &self.realized_hist);
        let vol_base = series_vol(&self.base_hist);
        let vol_prob = series_vol(&self.prob_hist);

        self.weights = bma_weights(ic_base, ic_prob, vol_base, vol_prob, self.kappa);
    }

    pub fn weights(&self) -> BmaWeights {
        self.weights
    }

    /// Blended bps score when `source=bma`: `w_base*base + w_prob*prob`.
    pub fn blend(&self, base_pred: f64, prob_pred: f64) -> f64 {
        self.weights.w_base * base_pred + self.weights.w_prob * prob_pred
    }
}

/// Pearson correlation between two equal-length series. Returns `0.0` on
/// fewer than 2 points or zero variance in either series, matching the
/// feature computer's NaN-retention convention of never propagating NaN.
pub fn rolling_ic(series: &VecDeque<f64>, realized: &VecDeque<f64>) -> f64 {
    let n = series.len().min(realized.len());
    if n < 2 {
        return 0.0;
    }
    let xs: Vec<f64> = series.iter().rev().take(n).copied().collect();
    let ys: Vec<f64> = realized.iter().rev().take(n).copied().collect();
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    (cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0)
}

/// Population standard deviation of a rolling window, floored to avoid a
/// divide-by-zero in `bma_weights`.
pub fn series_vol(series: &VecDeque<f64>) -> f64 {
    let n = series.len();
    if n < 2 {
        return 1e-6;
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let var = series.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    var.sqrt().max(1e-6)
}

/// `w_i = softmax(kappa * ic_i / vol_i)` over the two streams.
fn bma_weights(ic_base: f64, ic_prob: f64, vol_base: f64, vol_prob: f64, kappa: f64) -> BmaWeights {
    let score_base = kappa * ic_base / vol_base;
    let score_prob = kappa * ic_prob / vol_prob;
    let max_score = score_base.max(score_prob);
    let exp_base = (score_base - max_score).exp();
    let exp_prob = (score_prob - max_score).exp();
    let total = exp_base + exp_prob;
    if total <= 0.0 || !total.is_finite() {
        return BmaWeights {
            w_base: 0.5,
            w_prob: 0.5,
        };
    }
    BmaWeights {
        w_base: exp_base / total,
        w_prob: exp_prob / total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfectly_correlated_base_dominates_weight() {
        let mut blender = BmaBlender::new(50, 8.0, false);
        for i in 0..30 {
            let base = (i as f64) * 0.01;
            let prob = ((i as f64) * 0.01 * -1.0).sin() * 0.001; // near-uncorrelated noise
            let realized = (i as f64) * 0.01; // perfectly tracks base
            blender.push(base, prob, realized);
        }
        let w = blender.weights();
        assert!(w.w_base > w.w_prob);
        assert!((w.w_base + w.w_prob - 1.0).abs() < 1e-9);
    }

    #[test]
    fn frozen_blender_does_not_update_weights() {
        let mut blender = BmaBlender::new(50, 8.0, true);
        let before = blender.weights();
        blender.push(1.0, -1.0, 1.0);
        blender.push(1.0, -1.0, 1.0);
        let after = blender.weights();
        assert_eq!(before.w_base, after.w_base);
        assert_eq!(before.w_prob, after.w_prob);
    }

    #[test]
    fn rolling_ic_is_zero_with_insufficient_history() {
        let mut s = VecDeque::new();
        s.push_back(1.0);
        let mut r = VecDeque::new();
        r.push_back(1.0);
        assert_eq!(rolling_ic(&s, &r), 0.0);
    }

    #[test]
    fn blend_combines_weighted_streams() {
        let mut blender = BmaBlender::new(50, 8.0, true);
        blender.weights = BmaWeights {
            w_base: 0.7,
            w_prob: 0.3,
        };
        let blended = blender.blend(10.0, -5.0);
        assert!((blended - 5.5).abs() < 1e-9);
    }
}

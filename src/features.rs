// =============================================================================
// Feature Computer — produces warmup-gated feature vectors
// =============================================================================
//
// EMA20 recursive update, dollar-scale mean-reversion z-score (never
// return-scale -- a return-scale denominator silently poisons the model with
// out-of-range features), realized vol from squared returns, single-bar
// Garman-Klass volatility, jump magnitude, volume intensity, price
// efficiency, a correlation of returns vs. volumes that freezes on the last
// finite value across a NaN, funding rate/momentum, and cohort flow diff.
// =============================================================================

use std::collections::VecDeque;

use crate::cohort::CohortSnapshot;
use crate::data_model::{Bar, FeatureVector};

const MIN_WARM_BARS: u64 = 50;

fn ret(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        0.0
    } else {
        (b / a) - 1.0
    }
}

fn gk_vol(o: f64, h: f64, l: f64, c: f64) -> f64 {
    if o <= 0.0 || h <= 0.0 || l <= 0.0 || c <= 0.0 {
        return 0.0;
    }
    let term1 = 0.5 * (h / l).ln().powi(2);
    let term2 = (2.0 * 2f64.ln() - 1.0) * (c / o).ln().powi(2);
    (term1 - term2).max(0.0).sqrt()
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted[sorted.len() / 2]
}

fn pearson_corr(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() < 3 || xs.len() != ys.len() {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..xs.len() {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    let corr = cov / (var_x.sqrt() * var_y.sqrt());
    if corr.is_finite() {
        Some(corr)
    } else {
        None
    }
}

/// Named feature primitives, in the order `FeatureBuilder` looks them up by
/// schema column name.
#[derive(Debug, Clone, Default)]
pub struct FeaturePrimitives {
    pub mom_1: f64,
    pub mom_3: f64,
    pub mr_ema20_z: f64,
    pub rv_1h: f64,
    pub regime_high_vol: f64,
    pub gk_volatility: f64,
    pub jump_magnitude: f64,
    pub volume_intensity: f64,
    pub price_efficiency: f64,
    pub price_volume_corr: f64,
    pub vwap_momentum: f64,
    pub depth_proxy: f64,
    pub funding_rate: f64,
    pub funding_momentum_1h: f64,
    pub flow_diff: f64,
    pub s_top: f64,
    pub s_bot: f64,
}

impl FeaturePrimitives {
    fn get(&self, column: &str) -> Option<f64> {
        match column {
            "mom_1" => Some(self.mom_1),
            "mom_3" => Some(self.mom_3),
            "mr_ema20_z" => Some(self.mr_ema20_z),
            "rv_1h" => Some(self.rv_1h),
            "regime_high_vol" => Some(self.regime_high_vol),
            "gk_volatility" => Some(self.gk_volatility),
            "jump_magnitude" => Some(self.jump_magnitude),
            "volume_intensity" => Some(self.volume_intensity),
            "price_efficiency" => Some(self.price_efficiency),
            "price_volume_corr" => Some(self.price_volume_corr),
            "vwap_momentum" => Some(self.vwap_momentum),
            "depth_proxy" => Some(self.depth_proxy),
            "funding_rate" => Some(self.funding_rate),
            "funding_momentum_1h" => Some(self.funding_momentum_1h),
            "flow_diff" => Some(self.flow_diff),
            "S_top" => Some(self.s_top),
            "S_bot" => Some(self.s_bot),
            _ => None,
        }
    }
}

/// Assembles a feature vector strictly in schema column order, defaulting
/// missing primitives to `0.0`.
pub struct FeatureBuilder {
    pub columns: Vec<String>,
}

impl FeatureBuilder {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn build(&self, primitives: &FeaturePrimitives) -> Vec<f64> {
        self.columns
            .iter()
            .map(|c| primitives.get(c).unwrap_or(0.0))
            .collect()
    }
}

pub struct LiveFeatureComputer {
    rv_window: usize,
    vol_window: usize,
    corr_window: usize,
    closes: VecDeque<f64>,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    vols: VecDeque<f64>,
    funding: VecDeque<f64>,
    ema20: f64,
    ema_alpha: f64,
    last_valid_corr: f64,
    price_dev_hist: VecDeque<f64>,
    bar_count: u64,
}

impl LiveFeatureComputer {
    pub fn new(rv_window: usize, vol_window: usize, corr_window: usize) -> Self {
        let vol_window = vol_window.max(3);
        Self {
            rv_window,
            vol_window,
            corr_window,
            closes: VecDeque::with_capacity(vol_window),
            highs: VecDeque::with_capacity(vol_window),
            lows: VecDeque::with_capacity(vol_window),
            vols: VecDeque::with_capacity(vol_window),
            funding: VecDeque::with_capacity(rv_window),
            ema20: 0.0,
            ema_alpha: 2.0 / 21.0,
            last_valid_corr: 0.0,
            price_dev_hist: VecDeque::with_capacity(vol_window),
            bar_count: 0,
        }
    }

    pub fn is_warmed(&self) -> bool {
        self.bar_count >= MIN_WARM_BARS
    }

    fn push_bounded(buf: &mut VecDeque<f64>, cap: usize, v: f64) {
        if buf.len() == cap {
            buf.pop_front();
        }
        buf.push_back(v);
    }

    /// Feed one bar plus cohort/funding context and return the primitives
    /// used to build the model's feature vector.
    pub fn update(&mut self, bar: &Bar, cohort: CohortSnapshot, funding: f64) -> FeaturePrimitives {
        let (o, h, l, c, v) = (bar.open, bar.high, bar.low, bar.close, bar.volume);

        self.bar_count += 1;

        let prev_close = self.closes.back().copied();
        Self::push_bounded(&mut self.closes, self.vol_window, c);
        Self::push_bounded(&mut self.highs, self.vol_window, h);
        Self::push_bounded(&mut self.lows, self.vol_window, l);
        Self::push_bounded(&mut self.vols, self.vol_window, v);
        Self::push_bounded(&mut self.funding, self.rv_window, funding);

        self.ema20 = if self.ema20 != 0.0 {
            (1.0 - self.ema_alpha) * self.ema20 + self.ema_alpha * c
        } else {
            c
        };

        let r1 = prev_close.map(|pc| ret(pc, c)).unwrap_or(0.0);
        let closes_vec: Vec<f64> = self.closes.iter().copied().collect();
        let n = closes_vec.len();
        let r3 = if n >= 3 {
            ret(closes_vec[n - 3], c)
        } else {
            0.0
        };

        // rv_1h: sqrt(sum of squared returns over the last rv_window steps)
        let mut rets = Vec::new();
        for i in 1..n.min(self.rv_window) {
            rets.push(ret(closes_vec[n - 1 - i], closes_vec[n - i]));
        }
        let rv_1h = if rets.is_empty() {
            0.0
        } else {
            rets.iter().map(|r| r * r).sum::<f64>().sqrt()
        };

        // regime_high_vol: compare against the median of historical rv windows.
        let mut rv_hist = Vec::new();
        for k in 2..n.min(self.rv_window + 2) {
            let mut seg = Vec::new();
            for i in 1..k.min(self.rv_window) {
                if n >= k + 1 - i && n >= k - i {
                    seg.push(ret(closes_vec[n - k - 1 + i], closes_vec[n - k + i]));
                }
            }
            rv_hist.push(if seg.is_empty() {
                0.0
            } else {
                seg.iter().map(|x| x * x).sum::<f64>().sqrt()
            });
        }
        let med = median(&rv_hist);
        let regime_high_vol = if rv_1h > 2.0 * med && rv_1h > 0.0 {
            1.0
        } else {
            0.0
        };

        let gk = gk_vol(o, h, l, c);
        let jump_mag = r1.abs();

        let vol_mean = if self.vols.is_empty() {
            1.0
        } else {
            self.vols.iter().sum::<f64>() / self.vols.len() as f64
        };
        let volume_intensity = (v / (vol_mean + 1e-9)) - 1.0;

        let price_range = if c != 0.0 { (h - l) / (c + 1e-9) } else { 0.0 };
        let price_efficiency = r1.abs() / (price_range + 1e-9);

        let price_volume_corr = if n >= 3 {
            let mut rr = Vec::new();
            for i in 1..n.min(self.corr_window) {
                rr.push(ret(closes_vec[n - 1 - i], closes_vec[n - i]));
            }
            let vols_vec: Vec<f64> = self.vols.iter().copied().collect();
            let vv: Vec<f64> = if vols_vec.len() >= rr.len() {
                vols_vec[vols_vec.len() - rr.len()..].to_vec()
            } else {
                Vec::new()
            };
            match pearson_corr(&rr, &vv) {
                Some(corr) => {
                    self.last_valid_corr = corr;
                    corr
                }
                None => self.last_valid_corr,
            }
        } else {
            0.0
        };

        let vwap_momentum = r3;
        let depth_proxy = 0.0;

        let funding_rate = funding;
        let f_ema = if self.funding.len() >= self.rv_window {
            self.funding.iter().sum::<f64>() / self.funding.len() as f64
        } else {
            funding_rate
        };
        let funding_momentum_1h = funding_rate - f_ema;

        let flow_diff = cohort.pros - cohort.amateurs;

        let price_dev = c - self.ema20;
        Self::push_bounded(&mut self.price_dev_hist, self.vol_window, price_dev);
        let mr_ema20_z = if self.price_dev_hist.len() >= 3 {
            let devs: Vec<f64> = self.price_dev_hist.iter().copied().collect();
            let mean = devs.iter().sum::<f64>() / devs.len() as f64;
            let var = devs.iter().map(|d| (d - mean).powi(2)).sum::<f64>()
                / (devs.len() as f64 - 1.0);
            let std = var.sqrt();
            price_dev / (std + 1e-9)
        } else {
            0.0
        };

        FeaturePrimitives {
            mom_1: r1,
            mom_3: r3,
            mr_ema20_z,
            rv_1h,
            regime_high_vol,
            gk_volatility: gk,
            jump_magnitude: jump_mag,
            volume_intensity,
            price_efficiency,
            price_volume_corr,
            vwap_momentum,
            depth_proxy,
            funding_rate,
            funding_momentum_1h,
            flow_diff,
            s_top: cohort.pros,
            s_bot: cohort.amateurs,
        }
    }
}

/// Builds a full, warmup-gated `FeatureVector` for a given bar.
pub fn build_feature_vector(
    computer: &mut LiveFeatureComputer,
    builder: &FeatureBuilder,
    bar: &Bar,
    cohort: CohortSnapshot,
    funding: f64,
) -> FeatureVector {
    let primitives = computer.update(bar, cohort, funding);
    let mut values = builder.build(&primitives);
    for v in values.iter_mut() {
        if !v.is_finite() {
            *v = 0.0;
        }
    }
    FeatureVector {
        values,
        is_warmed: computer.is_warmed(),
        bar_id: bar.bar_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts_ms: i64, o: f64, h: f64, l: f64, c: f64, v: f64, id: u64) -> Bar {
        Bar {
            ts_ms,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
            bar_id: id,
            funding: None,
            spread_bps: None,
            rv_1h: None,
        }
    }

    #[test]
    fn warms_up_after_fifty_bars() {
        let mut computer = LiveFeatureComputer::new(12, 50, 36);
        let cohort = CohortSnapshot::default();
        for i in 0..49u64 {
            computer.update(&bar(i as i64, 100.0, 101.0, 99.0, 100.5, 10.0, i), cohort, 0.0);
            assert!(!computer.is_warmed());
        }
        computer.update(&bar(49, 100.0, 101.0, 99.0, 100.5, 10.0, 49), cohort, 0.0);
        assert!(computer.is_warmed());
    }

    #[test]
    fn missing_schema_column_defaults_to_zero() {
        let builder = FeatureBuilder::new(vec!["mom_1".to_string(), "not_a_real_col".to_string()]);
        let primitives = FeaturePrimitives {
            mom_1: 0.5,
            ..Default::default()
        };
        let out = builder.build(&primitives);
        assert_eq!(out, vec![0.5, 0.0]);
    }

    #[test]
    fn feature_vector_never_contains_nan_or_inf() {
        let mut computer = LiveFeatureComputer::new(12, 50, 36);
        let builder = FeatureBuilder::new(vec![
            "mom_1".to_string(),
            "mr_ema20_z".to_string(),
            "price_efficiency".to_string(),
        ]);
        let cohort = CohortSnapshot::default();
        // Zero-range bar would otherwise produce a division blowup.
        let fv = build_feature_vector(
            &mut computer,
            &builder,
            &bar(0, 100.0, 100.0, 100.0, 100.0, 0.0, 0),
            cohort,
            0.0,
        );
        for v in fv.values {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn gk_vol_handles_nonpositive_inputs() {
        assert_eq!(gk_vol(0.0, 1.0, 1.0, 1.0), 0.0);
        assert_eq!(gk_vol(1.0, 1.0, 1.0, 1.0), 0.0);
    }
}

// =============================================================================
// Cohort Accumulator — per-bar flow integration for pros/amateurs/mood
// =============================================================================
//
// Integrates trade fills into three channels with optional ADV normalization
// and exponential recency decay, producing a bounded numeric signal per bar.
//
// Resolved application order (see DESIGN.md): ADV-normalize (skippable via
// `fill.pre_normalized`) -> decay (always applied) -> channel weight -> add
// to the current-bar accumulator.
//
// Fills landing in a bucket strictly behind the current one are dropped and
// counted, rather than silently folded into the current bucket.
// =============================================================================

use std::collections::VecDeque;

use crate::data_model::{Fill, FillSide};

#[derive(Debug, Clone, Copy, Default)]
pub struct CohortWeights {
    pub pros: f64,
    pub amateurs: f64,
    pub mood: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CohortSnapshot {
    pub pros: f64,
    pub amateurs: f64,
    pub mood: f64,
}

struct Channel {
    ring: VecDeque<f64>,
    capacity: usize,
    current: f64,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
            current: 0.0,
        }
    }

    fn flush(&mut self) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(self.current);
        self.current = 0.0;
    }

    fn snapshot(&self) -> f64 {
        let sum: f64 = self.ring.iter().sum::<f64>() + self.current;
        let denom = (self.ring.len() + 1).max(1) as f64;
        sum / denom
    }
}

pub struct CohortState {
    bar_interval_ms: i64,
    half_life_ms: f64,
    decay_enabled: bool,
    adv_enabled: bool,
    adv20: f64,
    timeframe_hours: f64,
    current_bar: Option<i64>,
    pros: Channel,
    amateurs: Channel,
    mood: Channel,
    pub dropped_late_fills: u64,
}

impl CohortState {
    pub fn new(bar_interval_ms: i64, ring_capacity: usize, half_life_ms: f64) -> Self {
        Self {
            bar_interval_ms,
            half_life_ms,
            decay_enabled: half_life_ms > 0.0,
            adv_enabled: true,
            adv20: 0.0,
            timeframe_hours: bar_interval_ms as f64 / 3_600_000.0,
            current_bar: None,
            pros: Channel::new(ring_capacity),
            amateurs: Channel::new(ring_capacity),
            mood: Channel::new(ring_capacity),
            dropped_late_fills: 0,
        }
    }

    pub fn set_adv20(&mut self, adv20: f64) {
        self.adv20 = adv20;
    }

    fn bucket_of(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.bar_interval_ms)
    }

    /// Integrate a single fill into all three channels. `now_ms` is the wall
    /// clock used only for decay age; bar-bucket logic is purely bar-time.
    pub fn update_from_fill(&mut self, fill: &Fill, weights: CohortWeights, now_ms: i64) {
        let bucket = self.bucket_of(fill.ts_ms);

        match self.current_bar {
            None => self.current_bar = Some(bucket),
            Some(cur) => {
                if bucket > cur {
                    self.pros.flush();
                    self.amateurs.flush();
                    self.mood.flush();
                    self.current_bar = Some(bucket);
                } else if bucket < cur {
                    // Late fill beyond the allowed buffer: drop and count.
                    self.dropped_late_fills += 1;
                    return;
                }
                // bucket == cur: accumulate into the current bucket.
            }
        }

        if fill.size <= 0.0 {
            return;
        }

        let sign = match fill.side {
            FillSide::Buy => 1.0,
            FillSide::Sell => -1.0,
        };
        let mut impact = sign * fill.size;

        if self.adv_enabled && !fill.pre_normalized {
            let denom = self.adv20 * (self.timeframe_hours / 24.0);
            if denom != 0.0 {
                impact /= denom;
            }
            // adv20 == 0 forces normalization to a no-op.
        }

        if self.decay_enabled {
            let age_ms = (now_ms - fill.ts_ms).max(0) as f64;
            impact *= (-age_ms / self.half_life_ms).exp();
        }

        self.pros.current += impact * weights.pros;
        self.amateurs.current += impact * weights.amateurs;
        self.mood.current += impact * weights.mood;
    }

    pub fn snapshot(&self) -> CohortSnapshot {
        CohortSnapshot {
            pros: self.pros.snapshot(),
            amateurs: self.amateurs.snapshot(),
            mood: self.mood.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ts_ms: i64, side: FillSide, size: f64) -> Fill {
        Fill {
            ts_ms,
            address: String::new(),
            symbol: "BTCUSDT".to_string(),
            side,
            price: 100.0,
            size,
            source: crate::types::FillSource::Public,
            pre_normalized: false,
        }
    }

    fn weights() -> CohortWeights {
        CohortWeights {
            pros: 1.0,
            amateurs: 1.0,
            mood: 1.0,
        }
    }

    #[test]
    fn first_fill_sets_current_bar_without_flush() {
        let mut state = CohortState::new(60_000, 10, 0.0);
        state.update_from_fill(&fill(1_000, FillSide::Buy, 2.0), weights(), 1_000);
        assert_eq!(state.current_bar, Some(0));
        let snap = state.snapshot();
        assert!((snap.pros - 2.0).abs() < 1e-9);
    }

    #[test]
    fn bar_boundary_crossing_flushes_into_ring() {
        let mut state = CohortState::new(60_000, 10, 0.0);
        state.update_from_fill(&fill(1_000, FillSide::Buy, 2.0), weights(), 1_000);
        state.update_from_fill(&fill(61_000, FillSide::Sell, 1.0), weights(), 61_000);
        // First bucket (value 2.0) is now in the ring; current accumulator
        // holds the new bucket's value (-1.0).
        let snap = state.snapshot();
        assert!((snap.pros - 0.5).abs() < 1e-9);
    }

    #[test]
    fn late_fill_is_dropped_not_accumulated() {
        let mut state = CohortState::new(60_000, 10, 0.0);
        state.update_from_fill(&fill(61_000, FillSide::Buy, 2.0), weights(), 61_000);
        state.update_from_fill(&fill(1_000, FillSide::Sell, 5.0), weights(), 61_000);
        assert_eq!(state.dropped_late_fills, 1);
        let snap = state.snapshot();
        assert!((snap.pros - 2.0).abs() < 1e-9);
    }

    #[test]
    fn adv_zero_is_noop_normalization() {
        let mut state = CohortState::new(60_000, 10, 0.0);
        state.set_adv20(0.0);
        state.update_from_fill(&fill(1_000, FillSide::Buy, 3.0), weights(), 1_000);
        let snap = state.snapshot();
        assert!((snap.pros - 3.0).abs() < 1e-9);
    }

    #[test]
    fn decay_shrinks_stale_fills() {
        let mut state = CohortState::new(60_000, 10, 1_000.0);
        // age = 2000ms over half_life 1000ms -> factor exp(-2) ~= 0.135
        state.update_from_fill(&fill(0, FillSide::Buy, 10.0), weights(), 2_000);
        let snap = state.snapshot();
        assert!(snap.pros < 2.0);
        assert!(snap.pros > 0.0);
    }

    #[test]
    fn zero_or_negative_size_has_zero_impact() {
        let mut state = CohortState::new(60_000, 10, 0.0);
        state.update_from_fill(&fill(1_000, FillSide::Buy, 0.0), weights(), 1_000);
        let snap = state.snapshot();
        assert_eq!(snap.pros, 0.0);
    }
}

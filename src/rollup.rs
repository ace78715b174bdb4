// =============================================================================
// Rollup Engine — deterministic N-to-1 OHLCV rollups
// =============================================================================
//
// Buffers consecutive base bars per overlay timeframe and emits a single
// aggregate bar once the buffer reaches its configured window size.
// =============================================================================

use std::collections::HashMap;

use crate::data_model::Bar;

pub struct Overlay {
    window: usize,
    buffer: Vec<Bar>,
    emitted_count: u64,
}

impl Overlay {
    fn new(window: usize) -> Self {
        Self {
            window,
            buffer: Vec::with_capacity(window),
            emitted_count: 0,
        }
    }

    /// Append a base bar; returns `Some(overlay_bar)` if the window just
    /// completed.
    fn push(&mut self, bar: Bar) -> Option<Bar> {
        self.buffer.push(bar);
        if self.buffer.len() < self.window {
            return None;
        }

        let first = self.buffer[0];
        let last = *self.buffer.last().unwrap();
        let high = self.buffer.iter().fold(f64::MIN, |acc, b| acc.max(b.high));
        let low = self.buffer.iter().fold(f64::MAX, |acc, b| acc.min(b.low));
        let volume: f64 = self.buffer.iter().map(|b| b.volume).sum();

        let overlay_bar = Bar {
            ts_ms: last.ts_ms,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
            bar_id: last.bar_id,
            funding: last.funding,
            spread_bps: last.spread_bps,
            rv_1h: last.rv_1h,
        };

        self.buffer.clear();
        self.emitted_count += 1;
        Some(overlay_bar)
    }

    fn is_ready(&self, min_bars: u64) -> bool {
        self.emitted_count >= min_bars
    }
}

/// Drives a set of named overlay timeframes from a single stream of base bars.
pub struct RollupEngine {
    overlays: HashMap<String, Overlay>,
}

impl RollupEngine {
    pub fn new() -> Self {
        Self {
            overlays: HashMap::new(),
        }
    }

    /// Register an overlay timeframe with its base-bar window size (e.g.
    /// `12` for 5m -> 1h, `144` for 5m -> 12h).
    pub fn register(&mut self, timeframe: impl Into<String>, window: usize) {
        self.overlays
            .insert(timeframe.into(), Overlay::new(window.max(1)));
    }

    /// Feed a new base bar to every registered overlay. Returns the emitted
    /// overlay bars keyed by timeframe name.
    pub fn on_base_bar(&mut self, bar: Bar) -> HashMap<String, Bar> {
        let mut emitted = HashMap::new();
        for (tf, overlay) in self.overlays.iter_mut() {
            if let Some(ob) = overlay.push(bar) {
                emitted.insert(tf.clone(), ob);
            }
        }
        emitted
    }

    pub fn is_timeframe_ready(&self, timeframe: &str, min_bars: u64) -> bool {
        self.overlays
            .get(timeframe)
            .map(|o| o.is_ready(min_bars))
            .unwrap_or(false)
    }
}

impl Default for RollupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts_ms: i64, open: f64, high: f64, low: f64, close: f64, volume: f64, bar_id: u64) -> Bar {
        Bar {
            ts_ms,
            open,
            high,
            low,
            close,
            volume,
            bar_id,
            funding: None,
            spread_bps: None,
            rv_1h: None,
        }
    }

    #[test]
    fn emits_exactly_one_overlay_bar_per_window() {
        let mut engine = RollupEngine::new();
        engine.register("1h", 12);

        let mut last_emitted = None;
        for i in 0..12u64 {
            let b = bar(
                (i as i64) * 300_000,
                100.0 + i as f64,
                105.0 + i as f64,
                95.0 + i as f64,
                102.0 + i as f64,
                10.0,
                i,
            );
            let emitted = engine.on_base_bar(b);
            if let Some(ob) = emitted.get("1h") {
                last_emitted = Some(*ob);
            }
        }

        let ob = last_emitted.expect("overlay bar must be emitted on the 12th base bar");
        assert_eq!(ob.open, 100.0); // first.open
        assert_eq!(ob.close, 102.0 + 11.0); // last.close
        assert_eq!(ob.high, 105.0 + 11.0); // max high
        assert_eq!(ob.low, 95.0); // min low
        assert_eq!(ob.volume, 120.0); // sum of volumes
        assert!(engine.is_timeframe_ready("1h", 1));
        assert!(!engine.is_timeframe_ready("1h", 2));
    }

    #[test]
    fn partial_window_emits_nothing() {
        let mut engine = RollupEngine::new();
        engine.register("1h", 12);
        for i in 0..11u64 {
            let b = bar(i as i64 * 300_000, 100.0, 101.0, 99.0, 100.0, 1.0, i);
            let emitted = engine.on_base_bar(b);
            assert!(emitted.get("1h").is_none());
        }
        assert!(!engine.is_timeframe_ready("1h", 1));
    }

    #[test]
    fn replaying_same_inputs_is_deterministic() {
        let bars: Vec<Bar> = (0..12u64)
            .map(|i| bar(i as i64 * 300_000, 100.0 + i as f64, 110.0, 90.0, 105.0, 5.0, i))
            .collect();

        let run = |bars: &[Bar]| {
            let mut engine = RollupEngine::new();
            engine.register("1h", 12);
            let mut out = None;
            for &b in bars {
                if let Some(ob) = engine.on_base_bar(b).get("1h") {
                    out = Some(*ob);
                }
            }
            out.unwrap()
        };

        let a = run(&bars);
        let b = run(&bars);
        assert_eq!(a.open, b.open);
        assert_eq!(a.close, b.close);
        assert_eq!(a.high, b.high);
        assert_eq!(a.low, b.low);
        assert_eq!(a.volume, b.volume);
    }
}

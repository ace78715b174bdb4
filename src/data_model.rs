// =============================================================================
// Core data model: Bar, Fill, FeatureVector, Prediction, Signal, Decision,
// Position, OrderIntent, BanditState, LogRecord
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::reason_codes::GuardReasonCode;
use crate::types::FillSource;

/// Immutable OHLCV bar, closed at `ts_ms`.
///
/// Invariant: `high >= max(open, close) >= min(open, close) >= low`.
/// Invariant: `ts_ms` strictly increasing per timeframe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bar_id: u64,
    pub funding: Option<f64>,
    pub spread_bps: Option<f64>,
    pub rv_1h: Option<f64>,
}

impl Bar {
    pub fn is_valid(&self) -> bool {
        let top = self.open.max(self.close);
        let bottom = self.open.min(self.close);
        self.high >= top && top >= bottom && bottom >= self.low
    }
}

/// A single trade fill used by the cohort accumulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub ts_ms: i64,
    /// Empty for public tape fills.
    pub address: String,
    pub symbol: String,
    pub side: FillSide,
    pub price: f64,
    pub size: f64,
    pub source: FillSource,
    /// When true, this fill's impact bypasses ADV normalization (it was
    /// already normalized upstream) but still receives recency decay.
    #[serde(default)]
    pub pre_normalized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSide {
    Buy,
    Sell,
}

impl Fill {
    /// Unique dedup key across the polling window.
    pub fn dedup_key(&self, tid: &str) -> (String, String) {
        (self.address.clone(), tid.to_string())
    }
}

/// Ordered feature vector matching a model's `feature_schema` column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f64>,
    pub is_warmed: bool,
    pub bar_id: u64,
}

/// Three-class model output plus the calibration parameters used to scale it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Prediction {
    pub p_down: f64,
    pub p_neutral: f64,
    pub p_up: f64,
    pub s_model: f64,
    pub a: f64,
    pub b: f64,
}

impl Prediction {
    pub fn neutral() -> Self {
        Self {
            p_down: 0.33,
            p_neutral: 0.34,
            p_up: 0.33,
            s_model: 0.0,
            a: 0.0,
            b: 1.0,
        }
    }

    /// `sum(p_*) == 1 ± 1e-6`.
    pub fn is_valid(&self) -> bool {
        let sum = self.p_down + self.p_neutral + self.p_up;
        self.p_down >= 0.0
            && self.p_neutral >= 0.0
            && self.p_up >= 0.0
            && (sum - 1.0).abs() < 1e-6
    }

    /// Calibrated prediction in basis points: `10000 * (a + b * s_model)`.
    pub fn calibrated_bps(&self) -> f64 {
        10_000.0 * (self.a + self.b * self.s_model)
    }
}

/// Per-timeframe directional signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Signal {
    pub direction: i32,
    pub alpha: f64,
    pub confidence: f64,
    pub bar_id: u64,
}

/// Single decision produced by the signal combiner, possibly reshaped by
/// the bandit/BMA stage and then the guard chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub direction: i32,
    pub alpha: f64,
    pub mode: String,
    pub chosen_arm: Option<String>,
    pub bandit_weights: BTreeMap<String, f64>,
    pub overlay: BTreeMap<String, f64>,
}

impl Decision {
    pub fn neutral(mode: impl Into<String>) -> Self {
        Self {
            direction: 0,
            alpha: 0.0,
            mode: mode.into(),
            chosen_arm: None,
            bandit_weights: BTreeMap::new(),
            overlay: BTreeMap::new(),
        }
    }
}

/// Signed paper position, `qty` in base units, `fraction` in `[-pos_max, pos_max]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub fraction: f64,
    pub qty: f64,
    pub avg_px: f64,
    pub realized_pnl: f64,
    pub opened_at_ms: i64,
}

impl Position {
    pub fn flat() -> Self {
        Self {
            fraction: 0.0,
            qty: 0.0,
            avg_px: 0.0,
            realized_pnl: 0.0,
            opened_at_ms: 0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty.abs() < 1e-12
    }
}

/// Gated order intent, the output of the pre-trade guard chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub side: crate::types::Side,
    pub intent_qty: f64,
    pub intent_notional: f64,
    pub reason_codes: BTreeMap<String, bool>,
    pub veto_reason_primary: Option<GuardReasonCode>,
    pub veto_reason_secondary: Option<GuardReasonCode>,
    pub guard_details: BTreeMap<String, f64>,
}

impl OrderIntent {
    pub fn hold() -> Self {
        Self {
            side: crate::types::Side::Hold,
            intent_qty: 0.0,
            intent_notional: 0.0,
            reason_codes: BTreeMap::new(),
            veto_reason_primary: None,
            veto_reason_secondary: None,
            guard_details: BTreeMap::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.side != crate::types::Side::Hold || self.intent_qty == 0.0
    }
}

/// A JSONL log record envelope. Stream-specific fields live in `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub run_id: String,
    pub ts_ist: String,
    pub schema_v: u32,
    pub bar_id: u64,
    pub asset: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_ohlc_invariant() {
        let b = Bar {
            ts_ms: 0,
            open: 100.0,
            high: 105.0,
            low: 95.0,
            close: 102.0,
            volume: 10.0,
            bar_id: 1,
            funding: None,
            spread_bps: None,
            rv_1h: None,
        };
        assert!(b.is_valid());

        let bad = Bar { high: 90.0, ..b };
        assert!(!bad.is_valid());
    }

    #[test]
    fn prediction_neutral_sums_to_one() {
        let p = Prediction::neutral();
        assert!(p.is_valid());
        assert_eq!(p.s_model, 0.0);
    }

    #[test]
    fn prediction_calibrated_bps() {
        let p = Prediction {
            p_down: 0.1,
            p_neutral: 0.2,
            p_up: 0.7,
            s_model: 0.6,
            a: 0.0,
            b: 1.0,
        };
        assert!((p.calibrated_bps() - 6000.0).abs() < 1e-9);
    }

    #[test]
    fn order_intent_hold_has_zero_qty() {
        let intent = OrderIntent::hold();
        assert!(intent.is_valid());
        assert_eq!(intent.intent_qty, 0.0);
    }
}

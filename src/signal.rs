// =============================================================================
// Signal Generator — maps a calibrated prediction to a per-timeframe Signal
// =============================================================================

use crate::data_model::{Prediction, Signal};

#[derive(Debug, Clone, Copy)]
pub struct SignalThresholds {
    pub min_confidence: f64,
    pub min_alpha: f64,
    pub neutral_band: f64,
}

pub fn generate_signal(prediction: &Prediction, thresholds: SignalThresholds, bar_id: u64) -> Signal {
    let confidence = prediction.p_up.max(prediction.p_down).max(prediction.p_neutral);

    let (direction, alpha) = if prediction.s_model.abs() < thresholds.neutral_band {
        (0, 0.0)
    } else {
        (prediction.s_model.signum() as i32, prediction.s_model.abs().min(1.0))
    };

    if confidence < thresholds.min_confidence || alpha < thresholds.min_alpha {
        return Signal {
            direction: 0,
            alpha: 0.0,
            confidence,
            bar_id,
        };
    }

    Signal {
        direction,
        alpha,
        confidence,
        bar_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> SignalThresholds {
        SignalThresholds {
            min_confidence: 0.4,
            min_alpha: 0.05,
            neutral_band: 0.01,
        }
    }

    #[test]
    fn strong_up_prediction_yields_positive_signal() {
        let p = Prediction {
            p_down: 0.1,
            p_neutral: 0.2,
            p_up: 0.7,
            s_model: 0.6,
            a: 0.0,
            b: 1.0,
        };
        let s = generate_signal(&p, thresholds(), 1);
        assert_eq!(s.direction, 1);
        assert!((s.alpha - 0.6).abs() < 1e-9);
    }

    #[test]
    fn below_neutral_band_is_neutral() {
        let p = Prediction {
            p_down: 0.33,
            p_neutral: 0.34,
            p_up: 0.33,
            s_model: 0.005,
            a: 0.0,
            b: 1.0,
        };
        let s = generate_signal(&p, thresholds(), 1);
        assert_eq!(s.direction, 0);
        assert_eq!(s.alpha, 0.0);
    }

    #[test]
    fn low_confidence_forces_neutral_even_with_strong_alpha() {
        let p = Prediction {
            p_down: 0.3,
            p_neutral: 0.35,
            p_up: 0.35,
            s_model: 0.6,
            a: 0.0,
            b: 1.0,
        };
        let s = generate_signal(&p, thresholds(), 1);
        assert_eq!(s.direction, 0);
    }

    #[test]
    fn alpha_is_clipped_to_one() {
        let p = Prediction {
            p_down: 0.0,
            p_neutral: 0.0,
            p_up: 1.0,
            s_model: 1.5,
            a: 0.0,
            b: 1.0,
        };
        let s = generate_signal(&p, thresholds(), 1);
        assert_eq!(s.alpha, 1.0);
    }
}

// =============================================================================
// Model Runtime — loads a frozen artifact manifest, delivers a Predictor
// =============================================================================
//
// An explicit `Predictor` capability in place of ad hoc monkey-patched
// inference. The manifest's artifact format is out of scope here; this
// module honors only the manifest *contract*: feature schema, calibration
// {a,b,band_bps}, and a two-stage calibrator chain (try raw probabilities,
// then raw features).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data_model::Prediction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParams {
    #[serde(default)]
    pub a: f64,
    #[serde(default = "default_b")]
    pub b: f64,
    #[serde(default)]
    pub band_bps: f64,
}

fn default_b() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub feature_schema_path: String,
    pub model_path: String,
    #[serde(default)]
    pub calibrator_path: Option<String>,
    #[serde(default)]
    pub calibration: CalibrationParams,
    #[serde(default)]
    pub feature_dim: Option<usize>,
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub trained_at_utc: Option<String>,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            a: 0.0,
            b: 1.0,
            band_bps: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FeatureSchemaPayload {
    Columns { feature_columns: Vec<String> },
    Cols { feature_cols: Vec<String> },
    Bare(Vec<String>),
}

pub fn load_feature_schema(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read feature schema {}", path.as_ref().display()))?;
    let payload: FeatureSchemaPayload = serde_json::from_str(&content)
        .with_context(|| format!("invalid feature schema payload at {}", path.as_ref().display()))?;
    Ok(match payload {
        FeatureSchemaPayload::Columns { feature_columns } => feature_columns,
        FeatureSchemaPayload::Cols { feature_cols } => feature_cols,
        FeatureSchemaPayload::Bare(cols) => cols,
    })
}

/// A model backend that maps a feature vector to a 3-class distribution.
pub trait Predictor: Send + Sync {
    fn infer(&self, x: &[f64]) -> Prediction;
}

/// Always-neutral predictor: used when the manifest or artifact fails to
/// load. Inference never raises; it only ever returns the neutral triple.
pub struct NeutralPredictor {
    pub calibration: CalibrationParams,
}

impl Predictor for NeutralPredictor {
    fn infer(&self, _x: &[f64]) -> Prediction {
        Prediction {
            a: self.calibration.a,
            b: self.calibration.b,
            ..Prediction::neutral()
        }
    }
}

/// A linear-in-score predictor driven by the manifest's calibration
/// parameters. This is the only form of "model" this core is allowed to
/// depend on, since the artifact's own training/serialization format is out
/// of scope; the raw score is the dot product of the feature vector against a weight
/// vector of matching length, squashed into a pseudo s_model via tanh so
/// `p_down/p_neutral/p_up` stay a valid simplex.
pub struct LinearPredictor {
    pub weights: Vec<f64>,
    pub calibration: CalibrationParams,
}

impl Predictor for LinearPredictor {
    fn infer(&self, x: &[f64]) -> Prediction {
        if x.len() != self.weights.len() || x.is_empty() {
            return NeutralPredictor {
                calibration: self.calibration.clone(),
            }
            .infer(x);
        }
        let raw: f64 = x.iter().zip(self.weights.iter()).map(|(a, b)| a * b).sum();
        let s_model = raw.tanh();
        let p_up = (1.0 + s_model).clamp(0.0, 2.0) / 3.0;
        let p_down = (1.0 - s_model).clamp(0.0, 2.0) / 3.0;
        let p_neutral = (1.0 - p_up - p_down).max(0.0);
        Prediction {
            p_down,
            p_neutral,
            p_up,
            s_model,
            a: self.calibration.a,
            b: self.calibration.b,
        }
    }
}

/// A two-stage calibrator: attempt to recalibrate the raw probability
/// triple; if that fails, attempt to recalibrate from the original feature
/// vector. Falls back to the uncalibrated input if both attempts fail.
pub trait Calibrator: Send + Sync {
    fn apply_to_probabilities(&self, p: [f64; 3]) -> Option<[f64; 3]>;
    fn apply_to_features(&self, x: &[f64]) -> Option<[f64; 3]>;
}

pub struct ModelRuntime {
    pub manifest: Manifest,
    pub columns: Vec<String>,
    predictor: Box<dyn Predictor>,
    calibrator: Option<Box<dyn Calibrator>>,
}

impl ModelRuntime {
    /// Load the manifest and feature schema; validate `feature_dim` if
    /// present. Never returns an `Err` for a missing/invalid model artifact
    /// -- it degrades to a neutral predictor and logs a single warning. An
    /// `Err` here is reserved for a manifest file that cannot even be
    /// parsed, which is a fatal configuration error handled by the caller.
    pub fn load(manifest_path: impl AsRef<Path>, predictor: Option<Box<dyn Predictor>>) -> Result<Self> {
        let content = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read manifest {}", manifest_path.as_ref().display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse manifest {}", manifest_path.as_ref().display()))?;

        let columns = load_feature_schema(&manifest.feature_schema_path).unwrap_or_else(|e| {
            warn!(error = %e, "feature schema missing or invalid, inference will use positional fallback");
            Vec::new()
        });

        if let Some(expected) = manifest.feature_dim {
            if expected != columns.len() {
                warn!(
                    expected,
                    actual = columns.len(),
                    "feature dimension mismatch between manifest and schema"
                );
            }
        }

        let predictor = predictor.unwrap_or_else(|| {
            warn!("no predictor backend supplied, degrading to neutral predictor");
            Box::new(NeutralPredictor {
                calibration: manifest.calibration.clone(),
            })
        });

        Ok(Self {
            manifest,
            columns,
            predictor,
            calibrator: None,
        })
    }

    pub fn with_calibrator(mut self, calibrator: Box<dyn Calibrator>) -> Self {
        self.calibrator = Some(calibrator);
        self
    }

    /// Infer a prediction; never raises. Applies the calibrator chain if
    /// present: try raw-probability recalibration first, then
    /// feature-based recalibration, in that order.
    pub fn infer(&self, x: &[f64]) -> Prediction {
        let base = self.predictor.infer(x);

        let calibrated = self.calibrator.as_ref().and_then(|cal| {
            cal.apply_to_probabilities([base.p_down, base.p_neutral, base.p_up])
                .or_else(|| cal.apply_to_features(x))
        });

        match calibrated {
            Some([p_down, p_neutral, p_up]) => Prediction {
                p_down,
                p_neutral,
                p_up,
                s_model: p_up - p_down,
                a: base.a,
                b: base.b,
            },
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_predictor_sums_to_one() {
        let predictor = NeutralPredictor {
            calibration: CalibrationParams::default(),
        };
        let p = predictor.infer(&[]);
        assert!(p.is_valid());
        assert_eq!(p.s_model, 0.0);
    }

    #[test]
    fn linear_predictor_degrades_to_neutral_on_dimension_mismatch() {
        let predictor = LinearPredictor {
            weights: vec![1.0, 2.0],
            calibration: CalibrationParams::default(),
        };
        let p = predictor.infer(&[1.0]);
        assert!(p.is_valid());
        assert_eq!(p.s_model, 0.0);
    }

    #[test]
    fn linear_predictor_is_valid_simplex() {
        let predictor = LinearPredictor {
            weights: vec![1.0, -1.0, 0.5],
            calibration: CalibrationParams::default(),
        };
        let p = predictor.infer(&[2.0, 1.0, 4.0]);
        assert!(p.is_valid());
    }
}

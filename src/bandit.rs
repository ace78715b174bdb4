// =============================================================================
// Bandit Arm Selector — epsilon-greedy contextual arm pick with checkpointing
// =============================================================================
//
// Four arms: pros, amateurs, model_meta, model_bma. Selection picks the
// highest running mean among eligible arms (those with a nonzero signal this
// bar), with probability `epsilon` substituting a uniform-random eligible arm
// instead, and an optional variance-aware exploration bonus added to each
// arm's mean before comparison. State is checkpointed (atomic write-to-tmp-
// then-rename, matching `config.rs::RuntimeConfig::save`) on every `select`
// and every `update`.
//
// Reward shaping: `reward = realized_bps * raw_signal_value_of_last_arm`.
// When the arm selected on the previous bar is ineligible this bar (no
// signal), the reward update is skipped entirely rather than crediting zero
// -- crediting zero would bias the arm's running mean toward zero on bars
// where it was simply not in play. See DESIGN.md.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const ARM_NAMES: [&str; 4] = ["pros", "amateurs", "model_meta", "model_bma"];

pub fn arm_index(name: &str) -> Option<usize> {
    match name {
        "pros" => Some(0),
        "amateurs" => Some(1),
        "model_meta" | "model" => Some(2),
        "model_bma" => Some(3),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditState {
    pub counts: [f64; 4],
    pub means: [f64; 4],
    pub variances: [f64; 4],
    #[serde(default)]
    pub updated_at: i64,
}

impl Default for BanditState {
    fn default() -> Self {
        Self {
            counts: [0.0; 4],
            means: [0.0; 4],
            variances: [0.0; 4],
            updated_at: 0,
        }
    }
}

/// One arm's raw signal this bar, used both for eligibility and for reward
/// shaping (`raw_val` is the exposure proxy multiplied into next bar's
/// reward if this arm is selected).
#[derive(Debug, Clone, Copy)]
pub struct ArmCandidate {
    pub raw_val: f64,
    pub eligible: bool,
}

pub struct SelectionResult {
    pub chosen_arm: Option<String>,
    pub chosen_index: Option<usize>,
    pub raw_val: Option<f64>,
    pub eligible: [bool; 4],
}

pub struct Bandit {
    pub state: BanditState,
    pub epsilon: f64,
    pub model_optimism: f64,
}

impl Bandit {
    pub fn new(epsilon: f64, model_optimism: f64) -> Self {
        Self {
            state: BanditState::default(),
            epsilon,
            model_optimism,
        }
    }

    pub fn load_or_new(path: impl AsRef<Path>, epsilon: f64, model_optimism: f64) -> Self {
        match Self::load(&path) {
            Ok(state) => Self {
                state,
                epsilon,
                model_optimism,
            },
            Err(_) => Self::new(epsilon, model_optimism),
        }
    }

    fn load(path: impl AsRef<Path>) -> Result<BanditState> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read bandit checkpoint {}", path.as_ref().display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Atomic write-to-tmp-then-rename, mirroring `config.rs::RuntimeConfig::save`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write bandit checkpoint tmp file {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename bandit checkpoint into place {}", path.display()))?;
        Ok(())
    }

    fn score(&self, idx: usize) -> f64 {
        let bonus = if idx == 2 || idx == 3 {
            self.model_optimism
        } else {
            0.0
        };
        // Variance-aware exploration bonus: sqrt(variance / max(count,1)).
        let n = self.state.counts[idx].max(1.0);
        let explore = (self.state.variances[idx] / n).sqrt();
        self.state.means[idx] + bonus + explore
    }

    /// Select an arm among the eligible candidates. Returns `chosen_arm:
    /// None` if no candidate is eligible this bar.
    pub fn select(&self, candidates: &[ArmCandidate; 4], rng: &mut impl Rng) -> SelectionResult {
        let eligible: [bool; 4] = std::array::from_fn(|i| candidates[i].eligible);
        let eligible_indices: Vec<usize> = (0..4).filter(|&i| eligible[i]).collect();

        if eligible_indices.is_empty() {
            return SelectionResult {
                chosen_arm: None,
                chosen_index: None,
                raw_val: None,
                eligible,
            };
        }

        let explore_roll = rng.gen::<f64>() < self.epsilon;
        let chosen = if explore_roll {
            eligible_indices[rng.gen_range(0..eligible_indices.len())]
        } else {
            eligible_indices
                .iter()
                .copied()
                .max_by(|&a, &b| self.score(a).partial_cmp(&self.score(b)).unwrap())
                .unwrap()
        };

        SelectionResult {
            chosen_arm: Some(ARM_NAMES[chosen].to_string()),
            chosen_index: Some(chosen),
            raw_val: Some(candidates[chosen].raw_val),
            eligible,
        }
    }

    /// Welford-style running mean/variance update of arm `idx` with `reward`.
    pub fn update(&mut self, idx: usize, reward: f64, now_ms: i64) {
        self.state.counts[idx] += 1.0;
        let n = self.state.counts[idx];
        let delta = reward - self.state.means[idx];
        self.state.means[idx] += delta / n;
        let delta2 = reward - self.state.means[idx];
        self.state.variances[idx] += delta * delta2;
        self.state.updated_at = now_ms;
    }

    /// Population variance as tracked by Welford's algorithm (`M2 / n`).
    pub fn variance_of(&self, idx: usize) -> f64 {
        if self.state.counts[idx] < 1.0 {
            0.0
        } else {
            self.state.variances[idx] / self.state.counts[idx]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn all_eligible(raw_vals: [f64; 4]) -> [ArmCandidate; 4] {
        std::array::from_fn(|i| ArmCandidate {
            raw_val: raw_vals[i],
            eligible: true,
        })
    }

    #[test]
    fn greedy_selection_picks_highest_mean() {
        let mut bandit = Bandit::new(0.0, 0.0);
        bandit.state.means = [0.1, 0.9, 0.2, 0.0];
        let mut rng = StdRng::seed_from_u64(1);
        let result = bandit.select(&all_eligible([1.0, 1.0, 1.0, 1.0]), &mut rng);
        assert_eq!(result.chosen_arm.as_deref(), Some("amateurs"));
    }

    #[test]
    fn no_eligible_arm_returns_none() {
        let bandit = Bandit::new(0.0, 0.0);
        let candidates: [ArmCandidate; 4] = std::array::from_fn(|_| ArmCandidate {
            raw_val: 0.0,
            eligible: false,
        });
        let mut rng = StdRng::seed_from_u64(1);
        let result = bandit.select(&candidates, &mut rng);
        assert!(result.chosen_arm.is_none());
    }

    #[test]
    fn update_tracks_running_mean() {
        let mut bandit = Bandit::new(0.0, 0.0);
        bandit.update(0, 10.0, 1);
        bandit.update(0, 20.0, 2);
        assert!((bandit.state.means[0] - 15.0).abs() < 1e-9);
        assert_eq!(bandit.state.counts[0], 2.0);
    }

    #[test]
    fn arm_index_maps_all_four_names() {
        assert_eq!(arm_index("pros"), Some(0));
        assert_eq!(arm_index("amateurs"), Some(1));
        assert_eq!(arm_index("model_meta"), Some(2));
        assert_eq!(arm_index("model_bma"), Some(3));
        assert_eq!(arm_index("nonsense"), None);
    }
}

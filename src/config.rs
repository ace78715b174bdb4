// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the overlay engine. Every tunable parameter
// lives here so that a timeframe instance can be reconfigured without a
// restart by replacing the checkpoint file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, EnsembleSource, ExecutionMode, TradingMode};

// -----------------------------------------------------------------------------
// Default-value helpers (required by serde `default = "..."` attribute)
// -----------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_interval() -> String {
    "5m".to_string()
}
fn default_warmup_bars() -> u32 {
    50
}
fn default_min_confidence() -> f64 {
    0.4
}
fn default_min_alpha() -> f64 {
    0.05
}
fn default_neutral_band() -> f64 {
    0.01
}
fn default_sigma_target() -> f64 {
    0.2
}
fn default_pos_max() -> f64 {
    1.0
}
fn default_cooldown_bars() -> u32 {
    1
}
fn default_bar_minutes() -> f64 {
    5.0
}
fn default_base_notional() -> f64 {
    10_000.0
}
fn default_vol_floor() -> f64 {
    0.0
}
fn default_adv_cap_pct() -> f64 {
    0.0
}
fn default_rebalance_min_pos_delta() -> f64 {
    0.0
}
fn default_daily_stop_dd_pct() -> f64 {
    5.0
}
fn default_warmup_skip_bars() -> u32 {
    0
}
fn default_cost_bps() -> f64 {
    2.0
}
fn default_slippage_bps() -> f64 {
    1.0
}
fn default_impact_k() -> f64 {
    0.01
}
fn default_max_impact_bps_hard() -> f64 {
    200.0
}
fn default_min_net_edge_bps() -> f64 {
    3.0
}
fn default_max_total_cost_bps() -> f64 {
    50.0
}
fn default_max_position_duration_bars() -> u32 {
    288
}
fn default_stop_loss_bps() -> f64 {
    150.0
}
fn default_take_profit_bps() -> f64 {
    150.0
}
fn default_funding_guard_bias() -> f64 {
    0.0005
}
fn default_min_sign_flip_gap_s() -> f64 {
    60.0
}
fn default_delta_pi_min_bps() -> f64 {
    1.0
}
fn default_max_orders_per_sec() -> u32 {
    2
}
fn default_adv_order_cap() -> f64 {
    0.02
}
fn default_adv_hour_cap() -> f64 {
    0.10
}
fn default_max_impact_bps() -> f64 {
    50.0
}
fn default_max_spread_bps() -> f64 {
    10.0
}
fn default_band_bps() -> f64 {
    5.0
}
fn default_timeframes() -> Vec<String> {
    vec!["5m".to_string(), "15m".to_string(), "1h".to_string()]
}
fn default_rollup_windows() -> Vec<u32> {
    vec![3, 12]
}
fn default_conflict_min_alpha() -> f64 {
    0.3
}
fn default_conflict_band_mult() -> f64 {
    1.0
}
fn default_passive_timeout_s() -> f64 {
    5.0
}
fn default_bandit_epsilon() -> f64 {
    0.1
}
fn default_health_emit_every_bars() -> u32 {
    12
}
fn default_ic_window_bars() -> u32 {
    200
}
fn default_kappa() -> f64 {
    4.0
}
fn default_starting_equity() -> f64 {
    100_000.0
}
fn default_ist_timezone() -> String {
    "Asia/Kolkata".to_string()
}
fn default_realized_vol_window() -> u32 {
    50
}

// -----------------------------------------------------------------------------
// Namespaced config tables
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            interval: default_interval(),
            warmup_bars: default_warmup_bars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_alpha")]
    pub min_alpha: f64,
    #[serde(default = "default_neutral_band")]
    pub neutral_band: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_alpha: default_min_alpha(),
            neutral_band: default_neutral_band(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_sigma_target")]
    pub sigma_target: f64,
    #[serde(default = "default_pos_max")]
    pub pos_max: f64,
    #[serde(default = "default_cooldown_bars")]
    pub cooldown_bars: u32,
    #[serde(default = "default_bar_minutes")]
    pub bar_minutes: f64,
    #[serde(default = "default_realized_vol_window")]
    pub realized_vol_window: u32,
    #[serde(default = "default_base_notional")]
    pub base_notional: f64,
    #[serde(default = "default_vol_floor")]
    pub vol_floor: f64,
    #[serde(default = "default_adv_cap_pct")]
    pub adv_cap_pct: f64,
    #[serde(default = "default_rebalance_min_pos_delta")]
    pub rebalance_min_pos_delta: f64,
    #[serde(default = "default_daily_stop_dd_pct")]
    pub daily_stop_dd_pct: f64,
    #[serde(default = "default_warmup_skip_bars")]
    pub warmup_skip_bars: u32,
    #[serde(default = "default_cost_bps")]
    pub cost_bps: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default = "default_impact_k")]
    pub impact_k: f64,
    #[serde(default = "default_max_impact_bps_hard")]
    pub max_impact_bps_hard: f64,
    #[serde(default = "default_true")]
    pub enable_net_edge_gating: bool,
    #[serde(default = "default_min_net_edge_bps")]
    pub min_net_edge_bps: f64,
    #[serde(default = "default_max_total_cost_bps")]
    pub max_total_cost_bps: f64,
    #[serde(default = "default_true")]
    pub enable_forced_exits: bool,
    #[serde(default = "default_max_position_duration_bars")]
    pub max_position_duration_bars: u32,
    #[serde(default = "default_stop_loss_bps")]
    pub stop_loss_bps: f64,
    #[serde(default = "default_take_profit_bps")]
    pub take_profit_bps: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sigma_target: default_sigma_target(),
            pos_max: default_pos_max(),
            cooldown_bars: default_cooldown_bars(),
            bar_minutes: default_bar_minutes(),
            realized_vol_window: default_realized_vol_window(),
            base_notional: default_base_notional(),
            vol_floor: default_vol_floor(),
            adv_cap_pct: default_adv_cap_pct(),
            rebalance_min_pos_delta: default_rebalance_min_pos_delta(),
            daily_stop_dd_pct: default_daily_stop_dd_pct(),
            warmup_skip_bars: default_warmup_skip_bars(),
            cost_bps: default_cost_bps(),
            slippage_bps: default_slippage_bps(),
            impact_k: default_impact_k(),
            max_impact_bps_hard: default_max_impact_bps_hard(),
            enable_net_edge_gating: true,
            min_net_edge_bps: default_min_net_edge_bps(),
            max_total_cost_bps: default_max_total_cost_bps(),
            enable_forced_exits: true,
            max_position_duration_bars: default_max_position_duration_bars(),
            stop_loss_bps: default_stop_loss_bps(),
            take_profit_bps: default_take_profit_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskControlsConfig {
    #[serde(default = "default_funding_guard_bias")]
    pub funding_guard_bias: f64,
    #[serde(default = "default_min_sign_flip_gap_s")]
    pub min_sign_flip_gap_s: f64,
    #[serde(default = "default_delta_pi_min_bps")]
    pub delta_pi_min_bps: f64,
    #[serde(default = "default_max_orders_per_sec")]
    pub max_orders_per_sec: u32,
    #[serde(default = "default_adv_order_cap")]
    pub adv_order_cap: f64,
    #[serde(default = "default_adv_hour_cap")]
    pub adv_hour_cap: f64,
    #[serde(default = "default_max_impact_bps")]
    pub max_impact_bps: f64,
}

impl Default for RiskControlsConfig {
    fn default() -> Self {
        Self {
            funding_guard_bias: default_funding_guard_bias(),
            min_sign_flip_gap_s: default_min_sign_flip_gap_s(),
            delta_pi_min_bps: default_delta_pi_min_bps(),
            max_orders_per_sec: default_max_orders_per_sec(),
            adv_order_cap: default_adv_order_cap(),
            adv_hour_cap: default_adv_hour_cap(),
            max_impact_bps: default_max_impact_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrostructureConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: f64,
}

impl Default for MicrostructureConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_spread_bps: default_max_spread_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_band_bps")]
    pub band_bps: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            band_bps: default_band_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
    #[serde(default = "default_rollup_windows")]
    pub rollup_windows: Vec<u32>,
    #[serde(default)]
    pub weights: Vec<f64>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeframes: default_timeframes(),
            rollup_windows: default_rollup_windows(),
            weights: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    #[serde(default = "default_true")]
    pub require_5m_15m_agreement: bool,
    #[serde(default = "default_true")]
    pub allow_1h_override: bool,
    #[serde(default = "default_true")]
    pub halve_on_1h_opposition: bool,
    #[serde(default = "default_conflict_band_mult")]
    pub conflict_band_mult: f64,
    #[serde(default = "default_conflict_min_alpha")]
    pub conflict_min_alpha: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            require_5m_15m_agreement: true,
            allow_1h_override: true,
            halve_on_1h_opposition: true,
            conflict_band_mult: default_conflict_band_mult(),
            conflict_min_alpha: default_conflict_min_alpha(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditExecConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bandit_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub model_optimism: f64,
}

impl Default for BanditExecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            epsilon: default_bandit_epsilon(),
            model_optimism: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_passive_timeout_s")]
    pub passive_timeout_s: f64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub bandit: BanditExecConfig,
    #[serde(default)]
    pub use_overlay: bool,
    #[serde(default = "default_health_emit_every_bars")]
    pub health_emit_every_bars: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            passive_timeout_s: default_passive_timeout_s(),
            dry_run: true,
            bandit: BanditExecConfig::default(),
            use_overlay: false,
            health_emit_every_bars: default_health_emit_every_bars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmaConfig {
    #[serde(default = "default_ic_window_bars")]
    pub ic_window_bars: u32,
    #[serde(default = "default_kappa")]
    pub kappa: f64,
    #[serde(default)]
    pub freeze: bool,
}

impl Default for BmaConfig {
    fn default() -> Self {
        Self {
            ic_window_bars: default_ic_window_bars(),
            kappa: default_kappa(),
            freeze: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default)]
    pub enable_bma: bool,
    #[serde(default)]
    pub source: EnsembleSource,
    #[serde(default)]
    pub bma: BmaConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            enable_bma: false,
            source: EnsembleSource::default(),
            bma: BmaConfig::default(),
        }
    }
}

fn default_emitter_root() -> String {
    "paper_trading_outputs/logs".to_string()
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_max_files() -> u32 {
    10
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_s() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_s() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterConfig {
    #[serde(default = "default_emitter_root")]
    pub base_dir: String,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: f64,
    #[serde(default = "default_true")]
    pub enable_async: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            base_dir: default_emitter_root(),
            max_file_size_mb: default_max_file_size_mb(),
            max_files: default_max_files(),
            compression: true,
            sampling_rate: default_sampling_rate(),
            retry_attempts: default_retry_attempts(),
            retry_delay_s: default_retry_delay_s(),
            batch_size: default_batch_size(),
            flush_interval_s: default_flush_interval_s(),
            enable_async: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_starting_equity")]
    pub starting_equity: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_equity: default_starting_equity(),
        }
    }
}

// -----------------------------------------------------------------------------
// RuntimeConfig
// -----------------------------------------------------------------------------

/// Top-level runtime configuration for one timeframe instance of the engine.
///
/// Every field (transitively) has a serde default so that older checkpoint
/// files missing new fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "default_ist_timezone")]
    pub local_timezone: String,

    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub risk_controls: RiskControlsConfig,
    #[serde(default)]
    pub microstructure: MicrostructureConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            local_timezone: default_ist_timezone(),
            data: DataConfig::default(),
            thresholds: ThresholdsConfig::default(),
            risk: RiskConfig::default(),
            risk_controls: RiskControlsConfig::default(),
            microstructure: MicrostructureConfig::default(),
            calibration: CalibrationConfig::default(),
            overlay: OverlayConfig::default(),
            alignment: AlignmentConfig::default(),
            execution: ExecutionConfig::default(),
            ensemble: EnsembleConfig::default(),
            paper: PaperConfig::default(),
            emitter: EmitterConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.data.symbol,
            interval = %config.data.interval,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.data.symbol, "BTCUSDT");
        assert_eq!(cfg.data.warmup_bars, 50);
        assert!((cfg.risk.sigma_target - 0.2).abs() < f64::EPSILON);
        assert!((cfg.risk.pos_max - 1.0).abs() < f64::EPSILON);
        assert!(cfg.risk.enable_net_edge_gating);
        assert!(cfg.alignment.halve_on_1h_opposition);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.data.interval, "5m");
        assert_eq!(cfg.risk_controls.max_orders_per_sec, 2);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "data": { "symbol": "ETHUSDT" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.data.symbol, "ETHUSDT");
        assert_eq!(cfg.data.interval, "5m");
        assert!((cfg.calibration.band_bps - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.data.symbol, cfg2.data.symbol);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert!((cfg.risk.impact_k - cfg2.risk.impact_k).abs() < f64::EPSILON);
    }
}

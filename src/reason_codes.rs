// =============================================================================
// Guard and veto reason codes
// =============================================================================
//
// Mirrors the fixed vocabulary the pre-trade guard chain and upstream veto
// logic emit into decision records. Kept as a closed enum (not free-form
// strings) so log consumers can rely on an exhaustive, stable set.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Reasons an order intent was vetoed before a decision reached the guard
/// chain (threshold/band-level pre-decision logic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoReasonCode {
    Threshold,
    Band,
    SpreadGuard,
    VolatilityOk,
    LiquidityOk,
    RiskOk,
}

/// Reasons a decision was blocked or modified by the pre-trade guard chain.
/// Ordering here matches the guard evaluation order in `guards.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardReasonCode {
    SpreadGuard,
    FundingGuard,
    MinSignFlip,
    DeltaPiMin,
    ImpactGuard,
    ImpactCritical,
    NetEdgeInsufficient,
    ThrottleGuard,
    AdvOrderCap,
    AdvHourCap,
    CalibrationBandGate,
}

impl std::fmt::Display for GuardReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SpreadGuard => "spread_guard",
            Self::FundingGuard => "funding_guard",
            Self::MinSignFlip => "min_sign_flip",
            Self::DeltaPiMin => "delta_pi_min",
            Self::ImpactGuard => "impact_guard",
            Self::ImpactCritical => "impact_critical",
            Self::NetEdgeInsufficient => "net_edge_insufficient",
            Self::ThrottleGuard => "throttle_guard",
            Self::AdvOrderCap => "adv_order_cap",
            Self::AdvHourCap => "adv_hour_cap",
            Self::CalibrationBandGate => "calibration_band_gate",
        };
        write!(f, "{s}")
    }
}

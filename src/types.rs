// =============================================================================
// Shared value types used across the overlay engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Trade side. `Hold` means no resulting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

impl Side {
    /// Map a signed direction (`-1`, `0`, `1`) to a side.
    pub fn from_direction(dir: i32) -> Self {
        match dir.signum() {
            1 => Self::Buy,
            -1 => Self::Sell,
            _ => Self::Hold,
        }
    }
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated (paper) fills.
/// This core only ever executes in paper mode; `Live` is carried as a
/// config value so the venue trait's shape stays honest about what a real
/// deployment would need, but no live order routing is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Execution mode for the paper executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Market,
    PassiveThenCross,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Market
    }
}

/// BMA signal source selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleSource {
    Bma,
    Stacked,
    Base,
}

impl Default for EnsembleSource {
    fn default() -> Self {
        Self::Base
    }
}

/// Fill origin: a user's own address, or public venue tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSource {
    User,
    Public,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_from_direction() {
        assert_eq!(Side::from_direction(1), Side::Buy);
        assert_eq!(Side::from_direction(-1), Side::Sell);
        assert_eq!(Side::from_direction(0), Side::Hold);
        assert_eq!(Side::from_direction(5), Side::Buy);
        assert_eq!(Side::from_direction(-5), Side::Sell);
    }

    #[test]
    fn trading_mode_default_is_paused() {
        assert_eq!(TradingMode::default(), TradingMode::Paused);
    }
}

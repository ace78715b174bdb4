// =============================================================================
// Engine error kinds
// =============================================================================
//
// Replaces the exception-for-control-flow pattern in the networking and
// venue layers with an explicit, typed split. Transient errors are always
// retryable; permanent errors escalate to fatal only at startup.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Retryable I/O: HTTP timeout, WS drop, rate limit.
    #[error("transient: {0}")]
    Transient(String),

    /// Fatal, non-retryable: schema mismatch, missing required config key.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Malformed or inconsistent data that should be skipped and counted,
    /// not raised: non-monotonic timestamp, duplicate bar, missing field.
    #[error("data anomaly: {0}")]
    DataAnomaly(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

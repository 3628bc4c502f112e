//! Pipeline error taxonomy
//!
//! `Pending` and partial resolution are not errors; they are
//! [`ResolutionState`](super::types::ResolutionState) values.

use super::market_data::MarketDataError;
use super::types::TokenIdentity;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Market data source does not know the token at all. Terminal for the call.
    #[error("data unavailable for {token}: {reason}")]
    DataUnavailable { token: TokenIdentity, reason: String },

    /// Recalibration declined: not enough resolved outcomes in the evaluation period
    #[error(
        "insufficient history: {found} resolved outcomes in [{period_start}, {period_end}), need {required}"
    )]
    InsufficientHistory {
        found: usize,
        required: usize,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },

    /// Candidate weights violate sum-to-one or per-weight bounds
    #[error("invalid weight vector: {0}")]
    InvalidWeightVector(String),

    /// Another replacement landed between preparing and installing a vector
    #[error("weight replacement conflict: prepared on v{expected}, active is v{found}")]
    WeightConflict { expected: u64, found: u64 },

    #[error("market data error: {0}")]
    MarketData(#[from] MarketDataError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema directory not found: {0}")]
    SchemaNotFound(String),

    #[error("store lock poisoned")]
    LockPoisoned,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Rejected runtime configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("tier thresholds must satisfy 0 <= tier3 <= tier2 <= tier1 <= 100 (got {tier1}/{tier2}/{tier3})")]
    TierLadder { tier1: f64, tier2: f64, tier3: f64 },

    #[error("{name} must be greater than zero")]
    NonPositive { name: &'static str },

    #[error("unknown alert tier: {0}")]
    UnknownTier(String),
}

impl PipelineError {
    /// Terminal for the call or pass, but never for the pipeline itself
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            PipelineError::DataUnavailable { .. } | PipelineError::InsufficientHistory { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_unavailable_is_skippable() {
        let err = PipelineError::DataUnavailable {
            token: TokenIdentity::new("solana", "abc"),
            reason: "no pairs".to_string(),
        };
        assert!(err.is_skippable());
        assert!(err.to_string().contains("solana:abc"));
    }

    #[test]
    fn test_invalid_weights_not_skippable() {
        let err = PipelineError::InvalidWeightVector("tg_signal=0.40 above 0.35".to_string());
        assert!(!err.is_skippable());
        assert!(err.to_string().contains("tg_signal"));
    }

    #[test]
    fn test_market_data_error_converts() {
        let err: PipelineError = MarketDataError::Transient("timeout".to_string()).into();
        assert!(matches!(err, PipelineError::MarketData(_)));
    }
}

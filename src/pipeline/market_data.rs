//! Market data collaborator contract
//!
//! The resolver and the live scoring inputs only ever talk to this trait.
//! `DexScreenerProvider` is the HTTP-backed implementation.

use super::types::{MarketSnapshot, TokenIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarketDataError {
    /// The provider cannot identify the token at all
    #[error("token unknown to market data provider: {0}")]
    UnknownToken(TokenIdentity),

    /// Timeouts, rate limits, 5xx. Worth retrying.
    #[error("transient market data failure: {0}")]
    Transient(String),
}

/// One historical price observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Source of price and snapshot observations
///
/// `Ok(None)` means the token is known but no sample exists for that instant;
/// it is not the same as `Err(UnknownToken)`.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Price of the token at (or closest before) `at`
    async fn get_price(
        &self,
        token: &TokenIdentity,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, MarketDataError>;

    /// Full snapshot (price, mcap, holders, volume) at `at`
    async fn get_snapshot(
        &self,
        token: &TokenIdentity,
        at: DateTime<Utc>,
    ) -> Result<Option<MarketSnapshot>, MarketDataError>;

    /// Price observations in `[from, to]`, used for peak discovery
    ///
    /// Providers without history return an empty list.
    async fn price_history(
        &self,
        _token: &TokenIdentity,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, MarketDataError> {
        Ok(Vec::new())
    }

    fn provider_name(&self) -> &'static str;
}

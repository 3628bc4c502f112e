//! Non-convergence composite inputs
//!
//! The narrative, profile, platform, market, depth and wallet sub-scores are
//! produced outside the convergence detector. Live scoring asks a
//! `ScoringInputsProvider`; the backtest rebuilds the same numbers from stored
//! outcomes with the heuristics below so both paths agree.

use super::composite::SubScores;
use super::error::PipelineError;
use super::market_data::{MarketDataError, MarketDataProvider};
use super::normalize::{cap_ratio_score, cap_score};
use super::types::{CallEvent, MarketSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Launchpads whose tokens carry a platform bonus
pub const LAUNCHPADS: [&str; 3] = ["clanker", "virtuals", "flaunch"];

pub fn is_launchpad(platform: &str) -> bool {
    LAUNCHPADS.contains(&platform.to_ascii_lowercase().as_str())
}

/// 25 points per narrative tag
pub fn narrative_score(tags: &BTreeSet<String>) -> f64 {
    cap_score(tags.len() as f64 * 25.0)
}

/// Layers of conviction: any tag, a launchpad, a second tag
pub fn depth_score(tags: &BTreeSet<String>, platform: &str) -> f64 {
    let mut layers = 0u32;
    if !tags.is_empty() {
        layers += 1;
    }
    if is_launchpad(platform) {
        layers += 1;
    }
    if tags.len() >= 2 {
        layers += 1;
    }
    cap_score(layers as f64 * 25.0)
}

/// Market cap sweet spot: 50K..=1M scores 60, up to 5M scores 30
pub fn profile_score(mcap: Option<f64>) -> f64 {
    match mcap {
        Some(m) if (50_000.0..=1_000_000.0).contains(&m) => 60.0,
        Some(m) if m > 1_000_000.0 && m <= 5_000_000.0 => 30.0,
        _ => 0.0,
    }
}

/// Turnover (volume / mcap, at most 40) plus a liquidity bonus
pub fn market_score(mcap: Option<f64>, volume_24h: Option<f64>, liquidity_usd: Option<f64>) -> f64 {
    let mcap = match mcap {
        Some(m) if m > 0.0 => m,
        _ => return 0.0,
    };

    let mut score = 0.0;
    if let Some(volume) = volume_24h.filter(|v| *v > 0.0) {
        score += cap_ratio_score(volume / mcap, 80.0).min(40.0);
    }
    score += match liquidity_usd {
        Some(l) if l >= 100_000.0 => 30.0,
        Some(l) if l >= 50_000.0 => 25.0,
        Some(l) if l >= 20_000.0 => 15.0,
        _ => 0.0,
    };
    cap_score(score)
}

pub fn platform_score(platform: &str) -> f64 {
    if is_launchpad(platform) {
        50.0
    } else {
        0.0
    }
}

/// Convergence strength rebuilt from a distinct-source count
///
/// Used where no live confidence exists (backtest). A single source is not
/// convergence.
pub fn tg_signal_from_source_count(distinct_sources: usize) -> f64 {
    if distinct_sources < 2 {
        0.0
    } else {
        cap_score(distinct_sources as f64 * 25.0)
    }
}

/// Six externally produced sub-scores; `tg_signal` is added by the detector
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalInputs {
    pub narrative: f64,
    pub profile: f64,
    pub platform: f64,
    pub market: f64,
    pub depth: f64,
    pub wallet: f64,
    /// Snapshot the inputs were derived from, if the provider took one
    #[serde(skip)]
    pub market_snapshot: Option<MarketSnapshot>,
}

impl ExternalInputs {
    pub fn with_tg_signal(&self, tg_signal: f64) -> SubScores {
        SubScores {
            narrative: self.narrative,
            profile: self.profile,
            platform: self.platform,
            market: self.market,
            depth: self.depth,
            wallet: self.wallet,
            tg_signal,
        }
    }
}

/// Supplies the non-convergence inputs for a call at scoring time
///
/// `Ok(None)` marks the token unscoreable right now; the engine skips it.
#[async_trait]
pub trait ScoringInputsProvider: Send + Sync {
    async fn inputs(
        &self,
        event: &CallEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<ExternalInputs>, PipelineError>;
}

/// Inputs derived from a market snapshot plus the call's own tags
///
/// No wallet intelligence is wired in, so `wallet` is always 0.
pub struct MarketInputs {
    provider: Arc<dyn MarketDataProvider>,
}

impl MarketInputs {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ScoringInputsProvider for MarketInputs {
    async fn inputs(
        &self,
        event: &CallEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<ExternalInputs>, PipelineError> {
        let snapshot = match self.provider.get_snapshot(&event.token, at).await {
            Ok(Some(s)) => s,
            Ok(None) => return Ok(None),
            Err(MarketDataError::UnknownToken(token)) => {
                return Err(PipelineError::DataUnavailable {
                    token,
                    reason: format!("{} has no market for it", self.provider.provider_name()),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let platform = event
            .platform
            .clone()
            .or_else(|| snapshot.platform.clone())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Some(ExternalInputs {
            narrative: narrative_score(&event.narrative_tags),
            profile: profile_score(snapshot.mcap),
            platform: platform_score(&platform),
            market: market_score(snapshot.mcap, snapshot.volume_24h, snapshot.liquidity_usd),
            depth: depth_score(&event.narrative_tags, &platform),
            wallet: 0.0,
            market_snapshot: Some(snapshot),
        }))
    }
}

//! Core data structures for the call-signal pipeline
//!
//! Entities flow leaves-first:
//! `CallEvent` → `CallOutcome` → `ChannelScore` → `ConvergenceSignal` → `CompositeScore`
//!
//! `CallEvent`, `ConvergenceSignal` and `CompositeScore` are immutable facts.
//! `CallOutcome` is superseded by appending a higher `version`, never edited.
//! `ChannelScore` is recomputed wholesale on every scoring pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Token identity: chain + contract address
///
/// EVM (`0x`) addresses are normalized to lowercase so the same contract called
/// with different casing maps to one convergence window. Base58 addresses are
/// case-sensitive and kept as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenIdentity {
    pub chain: String,
    pub address: String,
}

impl TokenIdentity {
    pub fn new(chain: &str, address: &str) -> Self {
        let address = address.trim();
        let address = if address.starts_with("0x") || address.starts_with("0X") {
            address.to_lowercase()
        } else {
            address.to_string()
        };
        Self {
            chain: chain.trim().to_lowercase(),
            address,
        }
    }
}

impl fmt::Display for TokenIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

/// Engagement counters sampled at a fixed offset after the call was posted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSnapshot {
    pub offset_secs: i64,
    pub reactions: Option<u32>,
    pub forwards: Option<u32>,
    pub views: Option<u32>,
}

/// A source asserting that a token merits attention
///
/// Created by the ingestion collaborator. `platform`, `narrative_tags` and
/// `ticker` are the collaborator's own classification of the message and may
/// be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub source_id: String,
    pub token: TokenIdentity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub engagement: Vec<EngagementSnapshot>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub narrative_tags: BTreeSet<String>,
    #[serde(default)]
    pub ticker: Option<String>,
}

impl CallEvent {
    pub fn new(source_id: &str, token: TokenIdentity, timestamp: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.to_string(),
            token,
            timestamp,
            engagement: Vec::new(),
            platform: None,
            narrative_tags: BTreeSet::new(),
            ticker: None,
        }
    }

    pub fn key(&self) -> CallKey {
        CallKey {
            source_id: self.source_id.clone(),
            token: self.token.clone(),
            mention_timestamp: self.timestamp,
        }
    }
}

/// Identity of one call: a source, a token and the instant it was mentioned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey {
    pub source_id: String,
    pub token: TokenIdentity,
    pub mention_timestamp: DateTime<Utc>,
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            self.source_id,
            self.token,
            self.mention_timestamp.timestamp()
        )
    }
}

/// Outcome resolution state machine
///
/// ```text
/// Pending ──► PartiallyResolved ──► Resolved
///    │               │
///    └───────────────┴──► Unresolved (staleness horizon reached)
/// ```
///
/// `Resolved` and `Unresolved` are terminal for the fixed-offset samples.
/// A `Resolved` outcome may still be superseded by a later peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionState {
    Pending,
    PartiallyResolved,
    Resolved,
    Unresolved,
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Pending => "PENDING",
            ResolutionState::PartiallyResolved => "PARTIAL",
            ResolutionState::Resolved => "RESOLVED",
            ResolutionState::Unresolved => "UNRESOLVED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ResolutionState::Pending),
            "PARTIAL" => Some(ResolutionState::PartiallyResolved),
            "RESOLVED" => Some(ResolutionState::Resolved),
            "UNRESOLVED" => Some(ResolutionState::Unresolved),
            _ => None,
        }
    }
}

/// Realized price history of one call
///
/// Missing samples are `None`, never zero. `roi_if_sold_at_peak` is in ratio
/// form: `3.0` means the token reached 4x the mention price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub source_id: String,
    pub token: TokenIdentity,
    pub mention_timestamp: DateTime<Utc>,
    pub price_at_mention: Option<f64>,
    pub price_1h: Option<f64>,
    pub price_6h: Option<f64>,
    pub price_24h: Option<f64>,
    pub price_peak: Option<f64>,
    pub peak_timestamp: Option<DateTime<Utc>>,
    pub mcap_at_mention: Option<f64>,
    pub holders_at_mention: Option<u64>,
    pub platform: String,
    pub narrative_tags: BTreeSet<String>,
    pub roi_if_sold_at_peak: Option<f64>,
    pub state: ResolutionState,
    pub version: u32,
    pub resolved_at: DateTime<Utc>,
}

impl CallOutcome {
    /// Fresh outcome for an event with no samples yet
    pub fn pending(event: &CallEvent, now: DateTime<Utc>) -> Self {
        Self {
            source_id: event.source_id.clone(),
            token: event.token.clone(),
            mention_timestamp: event.timestamp,
            price_at_mention: None,
            price_1h: None,
            price_6h: None,
            price_24h: None,
            price_peak: None,
            peak_timestamp: None,
            mcap_at_mention: None,
            holders_at_mention: None,
            platform: event
                .platform
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            narrative_tags: event.narrative_tags.clone(),
            roi_if_sold_at_peak: None,
            state: ResolutionState::Pending,
            version: 0,
            resolved_at: now,
        }
    }

    pub fn key(&self) -> CallKey {
        CallKey {
            source_id: self.source_id.clone(),
            token: self.token.clone(),
            mention_timestamp: self.mention_timestamp,
        }
    }

    /// ROI derived from the peak; `None` whenever the mention price is missing or zero
    pub fn compute_roi(price_at_mention: Option<f64>, price_peak: Option<f64>) -> Option<f64> {
        match (price_at_mention, price_peak) {
            (Some(entry), Some(peak)) if entry > 0.0 => Some(peak / entry - 1.0),
            _ => None,
        }
    }

    /// Counts toward aggregate statistics
    pub fn is_resolved(&self) -> bool {
        self.state == ResolutionState::Resolved && self.roi_if_sold_at_peak.is_some()
    }

    pub fn hit_2x(&self) -> bool {
        self.roi_if_sold_at_peak.map(|r| r >= 1.0).unwrap_or(false)
    }

    pub fn hit_5x(&self) -> bool {
        self.roi_if_sold_at_peak.map(|r| r >= 4.0).unwrap_or(false)
    }

    /// Seconds from mention to peak, only when the peak is known
    pub fn time_to_peak_secs(&self) -> Option<i64> {
        self.peak_timestamp
            .map(|peak| (peak - self.mention_timestamp).num_seconds())
    }

    /// True once every fixed-offset sample is present
    pub fn has_all_fixed_samples(&self) -> bool {
        self.price_at_mention.is_some()
            && self.price_1h.is_some()
            && self.price_6h.is_some()
            && self.price_24h.is_some()
    }

    pub fn has_any_sample(&self) -> bool {
        self.price_at_mention.is_some()
            || self.price_1h.is_some()
            || self.price_6h.is_some()
            || self.price_24h.is_some()
            || self.price_peak.is_some()
    }
}

/// Market-cap bucket used for `best_mcap_range`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum McapBucket {
    Under50K,
    From50KTo100K,
    From100KTo500K,
    From500KTo1M,
    Over1M,
}

impl McapBucket {
    pub fn from_mcap(mcap: f64) -> Self {
        if mcap < 50_000.0 {
            McapBucket::Under50K
        } else if mcap < 100_000.0 {
            McapBucket::From50KTo100K
        } else if mcap < 500_000.0 {
            McapBucket::From100KTo500K
        } else if mcap < 1_000_000.0 {
            McapBucket::From500KTo1M
        } else {
            McapBucket::Over1M
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            McapBucket::Under50K => "<50K",
            McapBucket::From50KTo100K => "50K-100K",
            McapBucket::From100KTo500K => "100K-500K",
            McapBucket::From500KTo1M => "500K-1M",
            McapBucket::Over1M => ">1M",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "<50K" => Some(McapBucket::Under50K),
            "50K-100K" => Some(McapBucket::From50KTo100K),
            "100K-500K" => Some(McapBucket::From100KTo500K),
            "500K-1M" => Some(McapBucket::From500KTo1M),
            ">1M" => Some(McapBucket::Over1M),
            _ => None,
        }
    }
}

/// Historical reliability grade of one source
///
/// `total_calls` counts resolved outcomes only. When it is zero every rate is
/// reported as zero in storage but the accessors return `None`: the source has
/// insufficient data, which is not the same as zero quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelScore {
    pub source_id: String,
    pub total_calls: u32,
    pub pending_calls: u32,
    pub hit_rate_2x: f64,
    pub hit_rate_5x: f64,
    pub avg_roi: f64,
    pub median_roi: f64,
    pub median_time_to_peak_secs: i64,
    pub best_platform: Option<String>,
    pub best_mcap_range: Option<McapBucket>,
    pub first_mover_score: f64,
    pub quality_score: f64,
    pub last_updated: DateTime<Utc>,
}

impl ChannelScore {
    /// All-zero score for a source with no resolved outcomes
    pub fn insufficient(source_id: &str, pending_calls: u32, now: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.to_string(),
            total_calls: 0,
            pending_calls,
            hit_rate_2x: 0.0,
            hit_rate_5x: 0.0,
            avg_roi: 0.0,
            median_roi: 0.0,
            median_time_to_peak_secs: 0,
            best_platform: None,
            best_mcap_range: None,
            first_mover_score: 0.0,
            quality_score: 0.0,
            last_updated: now,
        }
    }

    pub fn has_data(&self) -> bool {
        self.total_calls > 0
    }

    pub fn hit_rate_2x(&self) -> Option<f64> {
        self.has_data().then_some(self.hit_rate_2x)
    }

    pub fn hit_rate_5x(&self) -> Option<f64> {
        self.has_data().then_some(self.hit_rate_5x)
    }

    pub fn avg_roi(&self) -> Option<f64> {
        self.has_data().then_some(self.avg_roi)
    }

    pub fn first_mover_score(&self) -> Option<f64> {
        self.has_data().then_some(self.first_mover_score)
    }
}

/// Emitted when two or more distinct sources call the same token inside the window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSignal {
    pub token: TokenIdentity,
    /// Distinct sources, earliest first (ties by source id)
    pub contributing_sources: Vec<String>,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

/// Bookkeeping entry for first-mover attribution
///
/// One record per emission. `episode_start` is the timestamp of the earliest
/// entry still in the window, so emissions that only add late joiners share
/// the same episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    pub token: TokenIdentity,
    pub episode_start: DateTime<Utc>,
    /// (source_id, first timestamp in window), ordered by (timestamp, source_id)
    pub contributors: Vec<(String, DateTime<Utc>)>,
    pub recorded_at: DateTime<Utc>,
}

impl ConvergenceRecord {
    pub fn first_source(&self) -> Option<&str> {
        self.contributors.first().map(|(s, _)| s.as_str())
    }
}

/// Point-in-time market observation from the market-data collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: f64,
    pub mcap: Option<f64>,
    pub holders: Option<u64>,
    pub volume_24h: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub platform: Option<String>,
}

/// Launchpad token lifecycle row used as backtest history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformToken {
    pub token: TokenIdentity,
    pub platform: String,
    pub deploy_timestamp: DateTime<Utc>,
    pub mcap_1h: Option<f64>,
    pub peak_mcap: Option<f64>,
    pub peak_timestamp: Option<DateTime<Utc>>,
    pub volume_24h_at_peak: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub holders_24h: Option<u64>,
    pub narrative_tags: BTreeSet<String>,
    pub complete: bool,
}

impl PlatformToken {
    /// Peak ROI measured from the one-hour market cap, ratio form
    pub fn roi_from_1h(&self) -> Option<f64> {
        match (self.mcap_1h, self.peak_mcap) {
            (Some(entry), Some(peak)) if entry > 0.0 => Some(peak / entry - 1.0),
            _ => None,
        }
    }
}

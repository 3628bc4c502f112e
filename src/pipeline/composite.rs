//! Composite Scorer - seven bounded inputs, one bounded score, one tier
//!
//! `compose` is pure: no clock reads, no I/O, no global weights. Callers pass
//! the weight snapshot they want applied and persist the result themselves.

use super::error::ConfigError;
use super::normalize::{cap_score, fraction_to_score, round1};
use super::types::TokenIdentity;
use super::weights::{ScoreComponent, ScoringWeights};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sub-scores, each in [0, 100] once capped
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubScores {
    pub narrative: f64,
    pub profile: f64,
    pub platform: f64,
    pub market: f64,
    pub depth: f64,
    pub wallet: f64,
    pub tg_signal: f64,
}

impl SubScores {
    /// Convergence confidence is a [0, 1] fraction; the composite wants [0, 100]
    pub fn tg_signal_from_confidence(confidence: f64) -> f64 {
        fraction_to_score(confidence)
    }

    pub fn get(&self, component: ScoreComponent) -> f64 {
        match component {
            ScoreComponent::Narrative => self.narrative,
            ScoreComponent::Profile => self.profile,
            ScoreComponent::Platform => self.platform,
            ScoreComponent::Market => self.market,
            ScoreComponent::Depth => self.depth,
            ScoreComponent::Wallet => self.wallet,
            ScoreComponent::TgSignal => self.tg_signal,
        }
    }

    /// Every input capped into [0, 100], NaN as 0
    pub fn capped(&self) -> Self {
        Self {
            narrative: cap_score(self.narrative),
            profile: cap_score(self.profile),
            platform: cap_score(self.platform),
            market: cap_score(self.market),
            depth: cap_score(self.depth),
            wallet: cap_score(self.wallet),
            tg_signal: cap_score(self.tg_signal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
    Untiered,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Tier1 => "TIER1",
            Tier::Tier2 => "TIER2",
            Tier::Tier3 => "TIER3",
            Tier::Untiered => "UNTIERED",
        }
    }

    /// Accepts `tier1`, `TIER1`, `1`, ...
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tier1" | "1" => Some(Tier::Tier1),
            "tier2" | "2" => Some(Tier::Tier2),
            "tier3" | "3" => Some(Tier::Tier3),
            "untiered" | "none" => Some(Tier::Untiered),
            _ => None,
        }
    }

    /// True when `self` is `other` or better
    pub fn at_least(&self, other: Tier) -> bool {
        *self <= other
    }
}

/// Ordered thresholds; a total exactly on a boundary belongs to the higher tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLadder {
    pub tier1: f64,
    pub tier2: f64,
    pub tier3: f64,
}

impl Default for TierLadder {
    fn default() -> Self {
        Self {
            tier1: 80.0,
            tier2: 60.0,
            tier3: 40.0,
        }
    }
}

impl TierLadder {
    pub fn new(tier1: f64, tier2: f64, tier3: f64) -> Result<Self, ConfigError> {
        let ordered = 0.0 <= tier3 && tier3 <= tier2 && tier2 <= tier1 && tier1 <= 100.0;
        if !ordered {
            return Err(ConfigError::TierLadder { tier1, tier2, tier3 });
        }
        Ok(Self { tier1, tier2, tier3 })
    }

    pub fn classify(&self, total: f64) -> Tier {
        if total >= self.tier1 {
            Tier::Tier1
        } else if total >= self.tier2 {
            Tier::Tier2
        } else if total >= self.tier3 {
            Tier::Tier3
        } else {
            Tier::Untiered
        }
    }

    pub fn threshold(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Tier1 => Some(self.tier1),
            Tier::Tier2 => Some(self.tier2),
            Tier::Tier3 => Some(self.tier3),
            Tier::Untiered => None,
        }
    }
}

/// Immutable scoring snapshot for one token at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub token: TokenIdentity,
    pub scored_at: DateTime<Utc>,
    pub sub_scores: SubScores,
    pub weights: ScoringWeights,
    pub total: f64,
    pub tier: Tier,
}

/// `round(Σ weight·score, 1)` over capped inputs
pub fn weighted_total(inputs: &SubScores, weights: &ScoringWeights) -> f64 {
    let capped = inputs.capped();
    let sum: f64 = ScoreComponent::ALL
        .iter()
        .map(|c| weights.get(*c) * capped.get(*c))
        .sum();
    cap_score(round1(sum))
}

/// Combine sub-scores into a bounded total and tier
///
/// # Arguments
/// * `token` / `at` - Identify the snapshot; `at` is stored, never read from a clock
/// * `inputs` - Sub-scores; capped into [0, 100] here
/// * `weights` - Weight snapshot to apply (and record)
/// * `ladder` - Tier thresholds
pub fn compose(
    token: &TokenIdentity,
    at: DateTime<Utc>,
    inputs: &SubScores,
    weights: &ScoringWeights,
    ladder: &TierLadder,
) -> CompositeScore {
    let sub_scores = inputs.capped();
    let total = weighted_total(&sub_scores, weights);

    CompositeScore {
        token: token.clone(),
        scored_at: at,
        sub_scores,
        weights: weights.clone(),
        total,
        tier: ladder.classify(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_token() -> TokenIdentity {
        TokenIdentity::new("base", "0xabc")
    }

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn uniform(v: f64) -> SubScores {
        SubScores {
            narrative: v,
            profile: v,
            platform: v,
            market: v,
            depth: v,
            wallet: v,
            tg_signal: v,
        }
    }

    #[test]
    fn test_uniform_inputs_give_same_total() {
        let score = compose(
            &make_token(),
            at(),
            &uniform(70.0),
            &ScoringWeights::default(),
            &TierLadder::default(),
        );
        assert_eq!(score.total, 70.0);
        assert_eq!(score.tier, Tier::Tier2);
        assert_eq!(score.scored_at, at());
    }

    #[test]
    fn test_boundary_goes_to_higher_tier() {
        let ladder = TierLadder::default();
        assert_eq!(ladder.classify(80.0), Tier::Tier1);
        assert_eq!(ladder.classify(79.9), Tier::Tier2);
        assert_eq!(ladder.classify(60.0), Tier::Tier2);
        assert_eq!(ladder.classify(40.0), Tier::Tier3);
        assert_eq!(ladder.classify(39.9), Tier::Untiered);
    }

    #[test]
    fn test_out_of_range_inputs_capped() {
        let mut inputs = uniform(100.0);
        inputs.market = 340.0;
        inputs.wallet = -20.0;
        inputs.narrative = f64::NAN;

        let score = compose(
            &make_token(),
            at(),
            &inputs,
            &ScoringWeights::default(),
            &TierLadder::default(),
        );
        assert_eq!(score.sub_scores.market, 100.0);
        assert_eq!(score.sub_scores.wallet, 0.0);
        assert_eq!(score.sub_scores.narrative, 0.0);
        // 1.0 - narrative 0.20 - wallet 0.10 = 0.70
        assert_eq!(score.total, 70.0);
    }

    #[test]
    fn test_total_bounded_for_extreme_vectors() {
        // Every valid weight vector with bounded inputs stays in [0, 100]
        let vectors = [
            ScoringWeights::default(),
            ScoringWeights::from_array([0.35, 0.35, 0.05, 0.05, 0.05, 0.05, 0.10], 1),
            ScoringWeights::from_array([0.05, 0.05, 0.05, 0.05, 0.15, 0.30, 0.35], 1),
        ];
        let inputs = [uniform(0.0), uniform(100.0), uniform(55.55)];

        for w in &vectors {
            assert!(w.validate().is_ok());
            for i in &inputs {
                let total = weighted_total(i, w);
                assert!((0.0..=100.0).contains(&total), "total {} out of range", total);
            }
        }
        assert_eq!(weighted_total(&uniform(100.0), &vectors[1]), 100.0);
    }

    #[test]
    fn test_confidence_scaled() {
        assert_eq!(SubScores::tg_signal_from_confidence(0.5), 50.0);
        assert_eq!(SubScores::tg_signal_from_confidence(1.7), 100.0);
    }

    #[test]
    fn test_weights_recorded_with_version() {
        let mut weights = ScoringWeights::default();
        weights.version = 7;
        let score = compose(
            &make_token(),
            at(),
            &uniform(10.0),
            &weights,
            &TierLadder::default(),
        );
        assert_eq!(score.weights.version, 7);
    }

    #[test]
    fn test_tier_parse_and_order() {
        assert_eq!(Tier::parse("TIER2"), Some(Tier::Tier2));
        assert_eq!(Tier::parse("3"), Some(Tier::Tier3));
        assert_eq!(Tier::parse("gold"), None);
        assert!(Tier::Tier1.at_least(Tier::Tier2));
        assert!(Tier::Tier2.at_least(Tier::Tier2));
        assert!(!Tier::Tier3.at_least(Tier::Tier2));
    }

    #[test]
    fn test_ladder_must_be_ordered() {
        assert!(TierLadder::new(80.0, 60.0, 40.0).is_ok());
        assert!(TierLadder::new(60.0, 80.0, 40.0).is_err());
        assert!(TierLadder::new(120.0, 60.0, 40.0).is_err());
    }
}

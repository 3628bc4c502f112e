//! Backtest Engine - replay historical calls under candidate weight vectors
//!
//! History is rebuilt from stored outcomes and launchpad lifecycle rows, then
//! each candidate vector re-scores every sample and is graded by what the
//! resulting entries actually returned. Everything here is deterministic: the
//! same history and candidates always give the same report.

use super::channel_scorer::latest_versions;
use super::composite::{weighted_total, SubScores, Tier, TierLadder};
use super::inputs::{
    depth_score, market_score, narrative_score, platform_score, profile_score,
    tg_signal_from_source_count,
};
use super::types::{CallOutcome, PlatformToken, TokenIdentity};
use super::weights::ScoringWeights;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Where a historical sample came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleOrigin {
    Call { source_id: String },
    Platform { platform: String },
}

/// One scoreable moment in history with its realized result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSample {
    pub token: TokenIdentity,
    pub timestamp: DateTime<Utc>,
    pub origin: SampleOrigin,
    pub sub_scores: SubScores,
    /// Realized peak ROI, ratio form
    pub roi: f64,
}

impl HistoricalSample {
    pub fn hit_2x(&self) -> bool {
        self.roi >= 1.0
    }
}

/// Rebuild per-(token, timestamp) sub-scores from stored data
///
/// Resolved call outcomes (latest version only) and complete platform tokens
/// become samples. A call's `tg_signal` counts the distinct sources that called
/// the same token within `window` up to and including its mention. Platform
/// samples carry no convergence and score 0 there.
///
/// Outcomes hold no volume or liquidity, so their market input comes from the
/// mention market cap alone.
pub fn reconstruct_history(
    outcomes: &[CallOutcome],
    platform_tokens: &[PlatformToken],
    window: Duration,
) -> Vec<HistoricalSample> {
    let latest = latest_versions(outcomes.iter());

    // All calls per token, resolved or not: a call converges regardless of
    // whether its own outcome was ever measured
    let mut calls_by_token: HashMap<&TokenIdentity, Vec<(DateTime<Utc>, &str)>> = HashMap::new();
    for outcome in &latest {
        calls_by_token
            .entry(&outcome.token)
            .or_default()
            .push((outcome.mention_timestamp, outcome.source_id.as_str()));
    }

    let mut samples = Vec::new();

    for outcome in latest.iter().filter(|o| o.is_resolved()) {
        let Some(roi) = outcome.roi_if_sold_at_peak else {
            continue;
        };
        let start = outcome.mention_timestamp - window;
        let distinct: BTreeSet<&str> = calls_by_token
            .get(&outcome.token)
            .map(|calls| {
                calls
                    .iter()
                    .filter(|(ts, _)| *ts >= start && *ts <= outcome.mention_timestamp)
                    .map(|(_, source)| *source)
                    .collect()
            })
            .unwrap_or_default();

        samples.push(HistoricalSample {
            token: outcome.token.clone(),
            timestamp: outcome.mention_timestamp,
            origin: SampleOrigin::Call {
                source_id: outcome.source_id.clone(),
            },
            sub_scores: SubScores {
                narrative: narrative_score(&outcome.narrative_tags),
                profile: profile_score(outcome.mcap_at_mention),
                platform: platform_score(&outcome.platform),
                market: market_score(outcome.mcap_at_mention, None, None),
                depth: depth_score(&outcome.narrative_tags, &outcome.platform),
                wallet: 0.0,
                tg_signal: tg_signal_from_source_count(distinct.len()),
            },
            roi,
        });
    }

    for token in platform_tokens.iter().filter(|t| t.complete) {
        let Some(roi) = token.roi_from_1h() else {
            continue;
        };
        samples.push(HistoricalSample {
            token: token.token.clone(),
            timestamp: token.deploy_timestamp,
            origin: SampleOrigin::Platform {
                platform: token.platform.clone(),
            },
            sub_scores: SubScores {
                narrative: narrative_score(&token.narrative_tags),
                profile: profile_score(token.mcap_1h),
                platform: platform_score(&token.platform),
                market: market_score(token.mcap_1h, token.volume_24h_at_peak, token.liquidity_usd),
                depth: depth_score(&token.narrative_tags, &token.platform),
                wallet: 0.0,
                tg_signal: 0.0,
            },
            roi,
        });
    }

    samples.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.token.cmp(&b.token))
    });
    samples
}

/// Samples whose timestamp falls in `[start, end)`
pub fn samples_in_period(
    history: &[HistoricalSample],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<HistoricalSample> {
    history
        .iter()
        .filter(|s| s.timestamp >= start && s.timestamp < end)
        .cloned()
        .collect()
}

/// Result of entering every sample whose total reaches `threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub threshold: f64,
    pub entries: usize,
    pub hits_2x: usize,
    pub hit_rate: f64,
    pub mean_roi: f64,
    /// `hit_rate * max(mean_roi, 0)`, the recalibration objective
    pub weighted_roi: f64,
}

/// Samples that landed in one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub tier: Tier,
    pub count: usize,
    pub hit_rate: f64,
    pub mean_roi: f64,
}

/// Best tier-1 / tier-2 cut found by the threshold sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSweep {
    pub tier1: f64,
    pub tier2: f64,
    pub tier1_policy: PolicyStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub weights: ScoringWeights,
    /// Entry policies at the tier-1, tier-2 and tier-3 thresholds
    pub policies: Vec<PolicyStats>,
    pub tiers: Vec<TierStats>,
    pub best_thresholds: Option<ThresholdSweep>,
}

impl CandidateReport {
    pub fn policy_at(&self, threshold: f64) -> Option<&PolicyStats> {
        self.policies.iter().find(|p| p.threshold == threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub samples: usize,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub ladder: TierLadder,
    pub candidates: Vec<CandidateReport>,
}

/// Grade an entry policy over `(total, roi)` pairs
pub fn evaluate_policy(scored: &[(f64, f64)], threshold: f64) -> PolicyStats {
    let entered: Vec<f64> = scored
        .iter()
        .filter(|(total, _)| *total >= threshold)
        .map(|(_, roi)| *roi)
        .collect();

    if entered.is_empty() {
        return PolicyStats {
            threshold,
            entries: 0,
            hits_2x: 0,
            hit_rate: 0.0,
            mean_roi: 0.0,
            weighted_roi: 0.0,
        };
    }

    let entries = entered.len();
    let hits_2x = entered.iter().filter(|roi| **roi >= 1.0).count();
    let hit_rate = hits_2x as f64 / entries as f64;
    let mean_roi = entered.iter().sum::<f64>() / entries as f64;

    PolicyStats {
        threshold,
        entries,
        hits_2x,
        hit_rate,
        mean_roi,
        weighted_roi: hit_rate * mean_roi.max(0.0),
    }
}

/// Re-score `history` under one weight vector, `(total, roi)` per sample
pub fn score_history(history: &[HistoricalSample], weights: &ScoringWeights) -> Vec<(f64, f64)> {
    history
        .iter()
        .map(|s| (weighted_total(&s.sub_scores, weights), s.roi))
        .collect()
}

/// Sweep tier-1 over 60..=90 and tier-2 below it, both in steps of 5
///
/// Only the tier-1 bucket is graded; the first pair reaching the best
/// objective wins, so tier-2 settles on the lowest cut for that tier-1.
pub fn sweep_thresholds(scored: &[(f64, f64)]) -> Option<ThresholdSweep> {
    let mut best: Option<ThresholdSweep> = None;

    for t1 in (60..=90).step_by(5) {
        let policy = evaluate_policy(scored, t1 as f64);
        if policy.entries == 0 {
            continue;
        }
        for t2 in (40..t1).step_by(5) {
            let better = best
                .as_ref()
                .map(|b| policy.weighted_roi > b.tier1_policy.weighted_roi)
                .unwrap_or(true);
            if better {
                best = Some(ThresholdSweep {
                    tier1: t1 as f64,
                    tier2: t2 as f64,
                    tier1_policy: policy.clone(),
                });
            }
        }
    }
    best
}

fn tier_breakdown(scored: &[(f64, f64)], ladder: &TierLadder) -> Vec<TierStats> {
    [Tier::Tier1, Tier::Tier2, Tier::Tier3, Tier::Untiered]
        .into_iter()
        .map(|tier| {
            let rois: Vec<f64> = scored
                .iter()
                .filter(|(total, _)| ladder.classify(*total) == tier)
                .map(|(_, roi)| *roi)
                .collect();
            let count = rois.len();
            let (hit_rate, mean_roi) = if count == 0 {
                (0.0, 0.0)
            } else {
                (
                    rois.iter().filter(|r| **r >= 1.0).count() as f64 / count as f64,
                    rois.iter().sum::<f64>() / count as f64,
                )
            };
            TierStats {
                tier,
                count,
                hit_rate,
                mean_roi,
            }
        })
        .collect()
}

/// Backtest every candidate vector over the same history
///
/// # Arguments
/// * `history` - Samples from `reconstruct_history`, already filtered to the period
/// * `candidates` - Weight vectors to grade, reported in the given order
/// * `ladder` - Tier thresholds; entry policies are graded at each of them
pub fn backtest(
    history: &[HistoricalSample],
    candidates: &[ScoringWeights],
    ladder: &TierLadder,
) -> PerformanceReport {
    let thresholds = [ladder.tier1, ladder.tier2, ladder.tier3];

    let reports = candidates
        .iter()
        .map(|weights| {
            let scored = score_history(history, weights);
            CandidateReport {
                weights: weights.clone(),
                policies: thresholds
                    .iter()
                    .map(|t| evaluate_policy(&scored, *t))
                    .collect(),
                tiers: tier_breakdown(&scored, ladder),
                best_thresholds: sweep_thresholds(&scored),
            }
        })
        .collect();

    PerformanceReport {
        samples: history.len(),
        period_start: history.iter().map(|s| s.timestamp).min(),
        period_end: history.iter().map(|s| s.timestamp).max(),
        ladder: *ladder,
        candidates: reports,
    }
}

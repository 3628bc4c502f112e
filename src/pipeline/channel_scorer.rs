//! Channel Quality Scorer - per-source reliability from realized outcomes
//!
//! Every pass recomputes each `ChannelScore` from the full outcome set of
//! that source. Scores are never patched incrementally.
//!
//! Only outcomes in state `Resolved` with a defined ROI are counted. Pending,
//! partial and unresolved calls are reported in `pending_calls` and nowhere
//! else; they are never folded in as zero ROI.

use super::convergence::FirstMoverLedger;
use super::types::{CallKey, CallOutcome, ChannelScore, McapBucket};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// Parameters of the quality weight used by the convergence detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityWeightParams {
    /// Below this many resolved calls a source gets `default_weight`
    pub min_calls: u32,
    pub default_weight: f64,
    /// Resolved calls at which the sample-size factor saturates
    pub full_confidence_calls: u32,
}

impl Default for QualityWeightParams {
    fn default() -> Self {
        Self {
            min_calls: 5,
            default_weight: 0.3,
            full_confidence_calls: 20,
        }
    }
}

/// Weight of one source in convergence confidence
///
/// `0.1 + 0.9 * hit_rate_2x * min(total_calls / full_confidence_calls, 1)`.
/// New sources get a conservative default instead of zero so a good new
/// channel is not suppressed outright.
///
/// The default is not a floor. A source that reaches `min_calls` without a
/// single 2x falls from `default_weight` (0.3) to 0.1.
pub fn quality_weight(score: &ChannelScore, params: &QualityWeightParams) -> f64 {
    if score.total_calls < params.min_calls {
        return params.default_weight;
    }
    let sample_factor =
        (score.total_calls as f64 / params.full_confidence_calls.max(1) as f64).min(1.0);
    0.1 + 0.9 * score.hit_rate_2x.clamp(0.0, 1.0) * sample_factor
}

pub struct ChannelQualityScorer {
    min_bucket_samples: usize,
}

impl Default for ChannelQualityScorer {
    fn default() -> Self {
        Self::new(5)
    }
}

impl ChannelQualityScorer {
    pub fn new(min_bucket_samples: usize) -> Self {
        Self {
            min_bucket_samples: min_bucket_samples.max(1),
        }
    }

    /// Grade one source
    ///
    /// # Arguments
    /// * `source_id` - Source being graded; outcomes of other sources are ignored
    /// * `outcomes` - Outcome log; when a call appears in several versions only the highest counts
    /// * `ledger` - First-mover attribution from convergence history
    /// * `now` - Stamped into `last_updated`
    pub fn score(
        &self,
        source_id: &str,
        outcomes: &[CallOutcome],
        ledger: &FirstMoverLedger,
        now: DateTime<Utc>,
    ) -> ChannelScore {
        let latest = latest_versions(outcomes.iter().filter(|o| o.source_id == source_id));
        let (resolved, pending): (Vec<&CallOutcome>, Vec<&CallOutcome>) =
            latest.into_iter().partition(|o| o.is_resolved());

        if resolved.is_empty() {
            return ChannelScore::insufficient(source_id, pending.len() as u32, now);
        }

        let rois: Vec<f64> = resolved
            .iter()
            .filter_map(|o| o.roi_if_sold_at_peak)
            .collect();
        let n = rois.len() as f64;

        let hit_rate_2x = resolved.iter().filter(|o| o.hit_2x()).count() as f64 / n;
        let hit_rate_5x = resolved.iter().filter(|o| o.hit_5x()).count() as f64 / n;
        let avg_roi = rois.iter().sum::<f64>() / n;
        let median_roi = median(&rois).unwrap_or(0.0);

        let peak_secs: Vec<f64> = resolved
            .iter()
            .filter_map(|o| o.time_to_peak_secs())
            .map(|s| s as f64)
            .collect();
        let median_time_to_peak_secs = median(&peak_secs).map(|m| m.round() as i64).unwrap_or(0);

        let best_platform = self.best_bucket(&resolved, |o| Some(o.platform.clone()));
        let best_mcap_range =
            self.best_bucket(&resolved, |o| o.mcap_at_mention.map(McapBucket::from_mcap));

        let first_mover_score = ledger.score(source_id).unwrap_or(0.0);
        let quality_score =
            quality_score(hit_rate_2x, hit_rate_5x, avg_roi, &rois, first_mover_score);

        ChannelScore {
            source_id: source_id.to_string(),
            total_calls: resolved.len() as u32,
            pending_calls: pending.len() as u32,
            hit_rate_2x,
            hit_rate_5x,
            avg_roi,
            median_roi,
            median_time_to_peak_secs,
            best_platform,
            best_mcap_range,
            first_mover_score,
            quality_score,
            last_updated: now,
        }
    }

    /// Grade every source present in `outcomes`, best quality first
    pub fn score_all(
        &self,
        outcomes: &[CallOutcome],
        ledger: &FirstMoverLedger,
        now: DateTime<Utc>,
    ) -> Vec<ChannelScore> {
        let mut sources: Vec<&str> = outcomes.iter().map(|o| o.source_id.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();

        let mut scores: Vec<ChannelScore> = sources
            .into_iter()
            .map(|source| self.score(source, outcomes, ledger, now))
            .collect();

        scores.sort_by(|a, b| {
            b.quality_score
                .total_cmp(&a.quality_score)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        scores
    }

    /// Bucket with the highest mean ROI among buckets with enough samples.
    /// Ties go to the bucket that sorts first.
    fn best_bucket<K, F>(&self, resolved: &[&CallOutcome], key_fn: F) -> Option<K>
    where
        K: Ord + Clone,
        F: Fn(&CallOutcome) -> Option<K>,
    {
        let mut buckets: BTreeMap<K, Vec<f64>> = BTreeMap::new();
        for outcome in resolved {
            if let (Some(key), Some(roi)) = (key_fn(*outcome), outcome.roi_if_sold_at_peak) {
                buckets.entry(key).or_default().push(roi);
            }
        }

        let mut best: Option<(K, f64)> = None;
        for (key, rois) in buckets {
            if rois.len() < self.min_bucket_samples {
                continue;
            }
            let mean = rois.iter().sum::<f64>() / rois.len() as f64;
            match &best {
                Some((_, best_mean)) if mean <= *best_mean => {}
                _ => best = Some((key, mean)),
            }
        }
        best.map(|(key, _)| key)
    }
}

/// Keep only the highest version of each call
pub fn latest_versions<'a, I>(outcomes: I) -> Vec<&'a CallOutcome>
where
    I: IntoIterator<Item = &'a CallOutcome>,
{
    let mut latest: HashMap<CallKey, &CallOutcome> = HashMap::new();
    for outcome in outcomes {
        latest
            .entry(outcome.key())
            .and_modify(|current| {
                if outcome.version > current.version {
                    *current = outcome;
                }
            })
            .or_insert(outcome);
    }
    let mut result: Vec<&CallOutcome> = latest.into_values().collect();
    result.sort_by(|a, b| a.key().cmp(&b.key()));
    result
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// 0-100 grade: 35% 2x rate, 20% 5x rate (doubled, capped), 15% average ROI
/// (capped at 5x), 20% consistency, 10% first-mover tendency
fn quality_score(
    hit_rate_2x: f64,
    hit_rate_5x: f64,
    avg_roi: f64,
    rois: &[f64],
    first_mover: f64,
) -> f64 {
    let hr_2x_component = hit_rate_2x * 100.0;
    let hr_5x_component = (hit_rate_5x * 200.0).min(100.0);
    let roi_component = if avg_roi > 0.0 {
        (avg_roi * 100.0 / 5.0).min(100.0)
    } else {
        0.0
    };

    let consistency = if rois.len() >= 3 {
        let n = rois.len() as f64;
        let variance = rois.iter().map(|r| (r - avg_roi).powi(2)).sum::<f64>() / (n - 1.0);
        let mean_abs = if avg_roi != 0.0 { avg_roi.abs() } else { 1.0 };
        let cv = variance.sqrt() / mean_abs;
        (100.0 - cv * 20.0).max(0.0)
    } else {
        50.0
    };

    let quality = 0.35 * hr_2x_component
        + 0.20 * hr_5x_component
        + 0.15 * roi_component
        + 0.20 * consistency
        + 0.10 * first_mover * 100.0;

    (quality.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

//! Recalibration Engine - propose a better weight vector from recent history
//!
//! Search space: the current vector plus every single-step transfer of weight
//! between two components that keeps the vector valid. Objective: hit-rate
//! weighted ROI (`hit_rate * max(mean_roi, 0)`) of the entry policy at the
//! configured threshold. Ties keep the candidate closest (L1) to the current
//! vector, then the earliest generated, so an uninformative period never moves
//! the weights.

use super::backtest::{evaluate_policy, samples_in_period, score_history, HistoricalSample, PolicyStats};
use super::error::PipelineError;
use super::weights::{
    ScoreComponent, ScoringWeights, WeightAuditRecord, WeightJustification, WeightRegistry,
};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

const OBJECTIVE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct RecalibrationConfig {
    /// Evaluation period length, ending at `period_end`
    pub period: Duration,
    /// Fewer samples than this in the period declines recalibration
    pub min_outcomes: usize,
    /// Entry threshold the objective is measured at
    pub entry_threshold: f64,
    /// Transfer sizes tried between every ordered pair of components
    pub step_sizes: Vec<f64>,
}

impl Default for RecalibrationConfig {
    fn default() -> Self {
        Self {
            period: Duration::days(7),
            min_outcomes: 10,
            entry_threshold: 60.0,
            step_sizes: vec![0.05, 0.10],
        }
    }
}

/// Outcome of one recalibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recalibration {
    pub current: ScoringWeights,
    pub best: ScoringWeights,
    pub current_stats: PolicyStats,
    pub best_stats: PolicyStats,
    pub candidates_evaluated: usize,
    pub samples: usize,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl Recalibration {
    /// True when the winner differs from the active vector
    pub fn changed(&self) -> bool {
        !self.best.same_values(&self.current)
    }

    pub fn justification(&self) -> WeightJustification {
        WeightJustification {
            statistic: self.best_stats.weighted_roi,
            previous_statistic: Some(self.current_stats.weighted_roi),
            period_start: self.period_start,
            period_end: self.period_end,
            reason: format!(
                "hit-rate weighted ROI at {:.0}: {:.4} → {:.4} over {} samples ({} candidates)",
                self.best_stats.threshold,
                self.current_stats.weighted_roi,
                self.best_stats.weighted_roi,
                self.samples,
                self.candidates_evaluated
            ),
        }
    }

    /// Audit record that would install the winner, without installing it
    ///
    /// # Returns
    /// * `Ok(Some(record))` - Persist it, then `WeightRegistry::commit` it
    /// * `Ok(None)` - Current vector kept
    pub fn proposal(
        &self,
        registry: &WeightRegistry,
        now: DateTime<Utc>,
    ) -> Result<Option<WeightAuditRecord>, PipelineError> {
        if !self.changed() {
            info!("📊 Recalibration kept weights {}", self.current);
            return Ok(None);
        }
        registry
            .prepare(self.best.clone(), self.justification(), now)
            .map(Some)
    }
}

fn round_weight(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Current vector first, then every valid single-step transfer
///
/// Order is deterministic: by step size, then source component, then target
/// component. Duplicates of an earlier candidate are dropped.
pub fn candidate_vectors(current: &ScoringWeights, step_sizes: &[f64]) -> Vec<ScoringWeights> {
    let mut candidates = vec![current.clone()];

    for step in step_sizes {
        for from in ScoreComponent::ALL {
            for to in ScoreComponent::ALL {
                if from == to {
                    continue;
                }
                let candidate = current
                    .with(from, round_weight(current.get(from) - step))
                    .with(to, round_weight(current.get(to) + step));
                if candidate.validate().is_err() {
                    continue;
                }
                if candidates.iter().any(|c| c.same_values(&candidate)) {
                    continue;
                }
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Search for the best vector over `[period_end - period, period_end)`
///
/// # Arguments
/// * `history` - Reconstructed samples; filtered to the period here
/// * `current` - Active vector, candidate zero
/// * `period_end` - Exclusive end of the evaluation period
/// * `config` - Period, minimum sample count, entry threshold, step sizes
///
/// # Returns
/// * `Err(InsufficientHistory)` - Too few samples; the weights must stay as they are
pub fn recalibrate(
    history: &[HistoricalSample],
    current: &ScoringWeights,
    period_end: DateTime<Utc>,
    config: &RecalibrationConfig,
) -> Result<Recalibration, PipelineError> {
    let period_start = period_end - config.period;
    let samples = samples_in_period(history, period_start, period_end);

    if samples.len() < config.min_outcomes {
        warn!(
            "⚠️  Recalibration skipped: {} samples in period, need {}",
            samples.len(),
            config.min_outcomes
        );
        return Err(PipelineError::InsufficientHistory {
            found: samples.len(),
            required: config.min_outcomes,
            period_start,
            period_end,
        });
    }

    let candidates = candidate_vectors(current, &config.step_sizes);
    let mut best_idx = 0;
    let mut best_stats: Option<PolicyStats> = None;
    let mut current_stats: Option<PolicyStats> = None;

    for (idx, candidate) in candidates.iter().enumerate() {
        let stats = evaluate_policy(&score_history(&samples, candidate), config.entry_threshold);
        if idx == 0 {
            current_stats = Some(stats.clone());
        }

        let better = match &best_stats {
            None => true,
            Some(best) => {
                let diff = stats.weighted_roi - best.weighted_roi;
                if diff > OBJECTIVE_EPSILON {
                    true
                } else if diff.abs() <= OBJECTIVE_EPSILON {
                    // Strictly closer wins; equal distance keeps the earlier one
                    candidate.l1_distance(current) + OBJECTIVE_EPSILON
                        < candidates[best_idx].l1_distance(current)
                } else {
                    false
                }
            }
        };
        if better {
            best_idx = idx;
            best_stats = Some(stats);
        }
    }

    let (Some(current_stats), Some(best_stats)) = (current_stats, best_stats) else {
        // Candidate zero is always evaluated
        return Err(PipelineError::InvalidWeightVector(
            "no recalibration candidates".to_string(),
        ));
    };

    let result = Recalibration {
        current: current.clone(),
        best: candidates[best_idx].clone(),
        current_stats,
        best_stats,
        candidates_evaluated: candidates.len(),
        samples: samples.len(),
        period_start,
        period_end,
    };

    info!(
        "📊 Recalibration over {} samples: objective {:.4} → {:.4} (candidate {} of {})",
        result.samples,
        result.current_stats.weighted_roi,
        result.best_stats.weighted_roi,
        best_idx,
        result.candidates_evaluated
    );
    Ok(result)
}

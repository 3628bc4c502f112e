//! Scoring weights and their atomically swapped registry
//!
//! A weight vector is always complete: seven named weights, each within
//! [`WEIGHT_MIN`, `WEIGHT_MAX`], summing to 1.0. Readers take a snapshot with
//! [`WeightRegistry::current`] and pass it into `compose` explicitly; a
//! replacement swaps the whole vector so no reader sees a mix of two.

use super::error::PipelineError;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const WEIGHT_MIN: f64 = 0.05;
pub const WEIGHT_MAX: f64 = 0.35;
pub const SUM_TOLERANCE: f64 = 1e-6;

/// The seven composite inputs, in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreComponent {
    Narrative,
    Profile,
    Platform,
    Market,
    Depth,
    Wallet,
    TgSignal,
}

impl ScoreComponent {
    pub const ALL: [ScoreComponent; 7] = [
        ScoreComponent::Narrative,
        ScoreComponent::Profile,
        ScoreComponent::Platform,
        ScoreComponent::Market,
        ScoreComponent::Depth,
        ScoreComponent::Wallet,
        ScoreComponent::TgSignal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreComponent::Narrative => "narrative",
            ScoreComponent::Profile => "profile",
            ScoreComponent::Platform => "platform",
            ScoreComponent::Market => "market",
            ScoreComponent::Depth => "depth",
            ScoreComponent::Wallet => "wallet",
            ScoreComponent::TgSignal => "tg_signal",
        }
    }

    fn index(&self) -> usize {
        match self {
            ScoreComponent::Narrative => 0,
            ScoreComponent::Profile => 1,
            ScoreComponent::Platform => 2,
            ScoreComponent::Market => 3,
            ScoreComponent::Depth => 4,
            ScoreComponent::Wallet => 5,
            ScoreComponent::TgSignal => 6,
        }
    }
}

/// Versioned weight vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub narrative: f64,
    pub profile: f64,
    pub platform: f64,
    pub market: f64,
    pub depth: f64,
    pub wallet: f64,
    pub tg_signal: f64,
    #[serde(default)]
    pub version: u64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            narrative: 0.20,
            profile: 0.15,
            platform: 0.15,
            market: 0.15,
            depth: 0.10,
            wallet: 0.10,
            tg_signal: 0.15,
            version: 1,
        }
    }
}

impl ScoringWeights {
    pub fn from_array(values: [f64; 7], version: u64) -> Self {
        Self {
            narrative: values[0],
            profile: values[1],
            platform: values[2],
            market: values[3],
            depth: values[4],
            wallet: values[5],
            tg_signal: values[6],
            version,
        }
    }

    pub fn as_array(&self) -> [f64; 7] {
        [
            self.narrative,
            self.profile,
            self.platform,
            self.market,
            self.depth,
            self.wallet,
            self.tg_signal,
        ]
    }

    pub fn get(&self, component: ScoreComponent) -> f64 {
        self.as_array()[component.index()]
    }

    pub fn with(&self, component: ScoreComponent, value: f64) -> Self {
        let mut values = self.as_array();
        values[component.index()] = value;
        Self::from_array(values, self.version)
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Check bounds and sum; the first violation is reported
    pub fn validate(&self) -> Result<(), PipelineError> {
        for component in ScoreComponent::ALL {
            let w = self.get(component);
            if !w.is_finite() || w < WEIGHT_MIN - SUM_TOLERANCE || w > WEIGHT_MAX + SUM_TOLERANCE {
                return Err(PipelineError::InvalidWeightVector(format!(
                    "{}={:.4} outside [{:.2}, {:.2}]",
                    component.as_str(),
                    w,
                    WEIGHT_MIN,
                    WEIGHT_MAX
                )));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(PipelineError::InvalidWeightVector(format!(
                "weights sum to {:.6}, expected 1.0",
                sum
            )));
        }
        Ok(())
    }

    pub fn l1_distance(&self, other: &ScoringWeights) -> f64 {
        self.as_array()
            .iter()
            .zip(other.as_array().iter())
            .map(|(a, b)| (a - b).abs())
            .sum()
    }

    /// Same vector regardless of version
    pub fn same_values(&self, other: &ScoringWeights) -> bool {
        self.l1_distance(other) < SUM_TOLERANCE
    }
}

impl fmt::Display for ScoringWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} [", self.version)?;
        for (i, component) in ScoreComponent::ALL.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={:.2}", component.as_str(), self.get(*component))?;
        }
        write!(f, "]")
    }
}

/// Why a replacement happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightJustification {
    /// Objective value of the new vector over the evaluation period
    pub statistic: f64,
    /// Objective value of the replaced vector over the same period
    pub previous_statistic: Option<f64>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub reason: String,
}

/// One accepted weight replacement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightAuditRecord {
    pub before: ScoringWeights,
    pub after: ScoringWeights,
    pub justification: WeightJustification,
    pub recorded_at: DateTime<Utc>,
}

/// Process-wide holder of the active weight vector
pub struct WeightRegistry {
    current: ArcSwap<ScoringWeights>,
    audit: Mutex<Vec<WeightAuditRecord>>,
}

impl Default for WeightRegistry {
    fn default() -> Self {
        Self::new(ScoringWeights::default())
    }
}

impl WeightRegistry {
    /// Start from a stored or default vector; an invalid one falls back to defaults
    pub fn new(initial: ScoringWeights) -> Self {
        let initial = match initial.validate() {
            Ok(()) => initial,
            Err(e) => {
                log::warn!("⚠️  Stored weights rejected ({}), using defaults", e);
                ScoringWeights::default()
            }
        };
        Self {
            current: ArcSwap::from_pointee(initial),
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the active vector
    pub fn current(&self) -> Arc<ScoringWeights> {
        self.current.load_full()
    }

    /// Validate and atomically install `candidate`
    ///
    /// # Returns
    /// * `Ok(record)` - Installed with the next version; the audit record is
    ///   also kept in memory and should be persisted by the caller
    /// * `Err(InvalidWeightVector)` - Nothing changed, nothing audited
    pub fn replace(
        &self,
        candidate: ScoringWeights,
        justification: WeightJustification,
        now: DateTime<Utc>,
    ) -> Result<WeightAuditRecord, PipelineError> {
        candidate.validate()?;

        // Serialize replacements so version numbers stay gapless
        let mut audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        let record = self.record_for(candidate, justification, now);
        self.install(&mut audit, record.clone());
        Ok(record)
    }

    /// Validate `candidate` and build the record that would install it, without
    /// touching the active vector
    ///
    /// Persist the record, then hand it to [`WeightRegistry::commit`].
    pub fn prepare(
        &self,
        candidate: ScoringWeights,
        justification: WeightJustification,
        now: DateTime<Utc>,
    ) -> Result<WeightAuditRecord, PipelineError> {
        candidate.validate()?;
        Ok(self.record_for(candidate, justification, now))
    }

    /// Install a record from [`WeightRegistry::prepare`]
    ///
    /// # Returns
    /// * `Err(WeightConflict)` - The active vector moved since `prepare`; nothing changed
    pub fn commit(&self, record: WeightAuditRecord) -> Result<WeightAuditRecord, PipelineError> {
        let mut audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        let active = self.current.load().version;
        if active != record.before.version {
            return Err(PipelineError::WeightConflict {
                expected: record.before.version,
                found: active,
            });
        }
        self.install(&mut audit, record.clone());
        Ok(record)
    }

    fn record_for(
        &self,
        candidate: ScoringWeights,
        justification: WeightJustification,
        now: DateTime<Utc>,
    ) -> WeightAuditRecord {
        let before = self.current.load_full();
        let mut after = candidate;
        after.version = before.version + 1;
        WeightAuditRecord {
            before: (*before).clone(),
            after,
            justification,
            recorded_at: now,
        }
    }

    fn install(&self, audit: &mut Vec<WeightAuditRecord>, record: WeightAuditRecord) {
        self.current.store(Arc::new(record.after.clone()));
        log::info!("✅ Scoring weights replaced: {} → {}", record.before, record.after);
        audit.push(record);
    }

    pub fn audit_log(&self) -> Vec<WeightAuditRecord> {
        self.audit.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

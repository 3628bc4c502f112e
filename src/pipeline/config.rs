//! Pipeline configuration from environment variables

use super::composite::{Tier, TierLadder};
use super::error::ConfigError;
use super::recalibrate::RecalibrationConfig;
use super::resolver::ResolverConfig;
use std::env;
use std::str::FromStr;

/// Configuration for the callflow runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the idempotent `.sql` schema files
    pub schema_dir: String,

    /// Channel buffer size for call ingestion (events)
    pub channel_buffer: usize,

    /// Convergence window duration in seconds
    pub convergence_window_secs: i64,

    /// Idle-window garbage collection interval in milliseconds
    pub convergence_gc_interval_ms: u64,

    /// Maximum concurrent outcome resolutions
    pub resolver_max_concurrency: usize,

    /// Minimum spacing between market data requests in milliseconds
    pub resolver_request_spacing_ms: u64,

    /// How often unresolved outcomes are re-enqueued, in milliseconds
    pub resolver_retry_interval_ms: u64,

    /// Peak search horizon after the mention, in seconds
    pub outcome_peak_horizon_secs: i64,

    /// Age after which missing fixed-offset samples become permanently unresolved
    pub outcome_max_staleness_secs: i64,

    /// Relative rise a new peak must exceed (0.01 = 1%)
    pub peak_min_rise: f64,

    /// Minimum seconds between two accepted peak updates
    pub peak_min_interval_secs: i64,

    /// Channel scoring pass interval in milliseconds
    pub channel_scoring_interval_ms: u64,

    /// Minimum outcomes per platform / mcap bucket before it can be "best"
    pub min_bucket_samples: usize,

    /// Recalibration cycle interval in seconds
    pub recalibration_interval_secs: u64,

    /// Recalibration evaluation period in days
    pub recalibration_period_days: i64,

    /// Minimum resolved outcomes required in the evaluation period
    pub recalibration_min_outcomes: usize,

    pub tier1_threshold: f64,
    pub tier2_threshold: f64,
    pub tier3_threshold: f64,

    /// Lowest tier forwarded to the alert sink (`tier1`, `tier2`, `tier3`)
    pub alert_min_tier: String,

    /// Optional JSONL file receiving alerts in addition to the log sink
    pub alerts_jsonl_path: Option<String>,

    /// Master enable flag for pipeline
    pub enabled: bool,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CALLFLOW_DB_PATH` (default: /var/lib/callflow/callflow.db)
    /// - `CALLFLOW_SCHEMA_DIR` (default: sql)
    /// - `CALL_CHANNEL_BUFFER` (default: 10000)
    /// - `CONVERGENCE_WINDOW_SECS` (default: 7200)
    /// - `CONVERGENCE_GC_INTERVAL_MS` (default: 60000)
    /// - `RESOLVER_MAX_CONCURRENCY` (default: 4)
    /// - `RESOLVER_REQUEST_SPACING_MS` (default: 250)
    /// - `RESOLVER_RETRY_INTERVAL_MS` (default: 300000)
    /// - `OUTCOME_PEAK_HORIZON_SECS` (default: 259200)
    /// - `OUTCOME_MAX_STALENESS_SECS` (default: 259200)
    /// - `PEAK_MIN_RISE` (default: 0.01)
    /// - `PEAK_MIN_INTERVAL_SECS` (default: 60)
    /// - `CHANNEL_SCORING_INTERVAL_MS` (default: 900000)
    /// - `MIN_BUCKET_SAMPLES` (default: 5)
    /// - `RECALIBRATION_INTERVAL_SECS` (default: 604800)
    /// - `RECALIBRATION_PERIOD_DAYS` (default: 7)
    /// - `RECALIBRATION_MIN_OUTCOMES` (default: 10)
    /// - `TIER1_THRESHOLD` / `TIER2_THRESHOLD` / `TIER3_THRESHOLD` (default: 80 / 60 / 40)
    /// - `ALERT_MIN_TIER` (default: tier2)
    /// - `ALERTS_JSONL_PATH` (default: unset)
    /// - `ENABLE_PIPELINE` (default: false)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("CALLFLOW_DB_PATH")
                .unwrap_or_else(|_| "/var/lib/callflow/callflow.db".to_string()),
            schema_dir: env::var("CALLFLOW_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),
            channel_buffer: env_or("CALL_CHANNEL_BUFFER", 10_000),
            convergence_window_secs: env_or("CONVERGENCE_WINDOW_SECS", 7_200),
            convergence_gc_interval_ms: env_or("CONVERGENCE_GC_INTERVAL_MS", 60_000),
            resolver_max_concurrency: env_or("RESOLVER_MAX_CONCURRENCY", 4),
            resolver_request_spacing_ms: env_or("RESOLVER_REQUEST_SPACING_MS", 250),
            resolver_retry_interval_ms: env_or("RESOLVER_RETRY_INTERVAL_MS", 300_000),
            outcome_peak_horizon_secs: env_or("OUTCOME_PEAK_HORIZON_SECS", 72 * 3_600),
            outcome_max_staleness_secs: env_or("OUTCOME_MAX_STALENESS_SECS", 72 * 3_600),
            peak_min_rise: env_or("PEAK_MIN_RISE", 0.01),
            peak_min_interval_secs: env_or("PEAK_MIN_INTERVAL_SECS", 60),
            channel_scoring_interval_ms: env_or("CHANNEL_SCORING_INTERVAL_MS", 900_000),
            min_bucket_samples: env_or("MIN_BUCKET_SAMPLES", 5),
            recalibration_interval_secs: env_or("RECALIBRATION_INTERVAL_SECS", 7 * 86_400),
            recalibration_period_days: env_or("RECALIBRATION_PERIOD_DAYS", 7),
            recalibration_min_outcomes: env_or("RECALIBRATION_MIN_OUTCOMES", 10),
            tier1_threshold: env_or("TIER1_THRESHOLD", 80.0),
            tier2_threshold: env_or("TIER2_THRESHOLD", 60.0),
            tier3_threshold: env_or("TIER3_THRESHOLD", 40.0),
            alert_min_tier: env::var("ALERT_MIN_TIER").unwrap_or_else(|_| "tier2".to_string()),
            alerts_jsonl_path: env::var("ALERTS_JSONL_PATH").ok().filter(|s| !s.is_empty()),
            enabled: env_or("ENABLE_PIPELINE", false),
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tier_ladder()?;
        self.alert_min_tier()?;

        if self.channel_buffer == 0 {
            return Err(ConfigError::NonPositive { name: "CALL_CHANNEL_BUFFER" });
        }
        if self.convergence_window_secs <= 0 {
            return Err(ConfigError::NonPositive { name: "CONVERGENCE_WINDOW_SECS" });
        }
        if self.resolver_max_concurrency == 0 {
            return Err(ConfigError::NonPositive { name: "RESOLVER_MAX_CONCURRENCY" });
        }
        if self.recalibration_period_days <= 0 {
            return Err(ConfigError::NonPositive { name: "RECALIBRATION_PERIOD_DAYS" });
        }
        Ok(())
    }

    pub fn tier_ladder(&self) -> Result<TierLadder, ConfigError> {
        TierLadder::new(self.tier1_threshold, self.tier2_threshold, self.tier3_threshold)
    }

    pub fn alert_min_tier(&self) -> Result<Tier, ConfigError> {
        Tier::parse(&self.alert_min_tier)
            .ok_or_else(|| ConfigError::UnknownTier(self.alert_min_tier.clone()))
    }

    pub fn convergence_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.convergence_window_secs)
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            peak_horizon: chrono::Duration::seconds(self.outcome_peak_horizon_secs),
            max_staleness: chrono::Duration::seconds(self.outcome_max_staleness_secs),
            min_peak_rise: self.peak_min_rise,
            min_peak_interval: chrono::Duration::seconds(self.peak_min_interval_secs),
            ..ResolverConfig::default()
        }
    }

    pub fn recalibration_config(&self) -> RecalibrationConfig {
        RecalibrationConfig {
            period: chrono::Duration::days(self.recalibration_period_days),
            min_outcomes: self.recalibration_min_outcomes,
            entry_threshold: self.tier2_threshold,
            ..RecalibrationConfig::default()
        }
    }
}

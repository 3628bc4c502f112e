//! Pipeline schedulers for background tasks
//!
//! - `ResolverPool` re-enqueues every outcome that can still change and
//!   resolves them with bounded concurrency (request spacing lives in the
//!   resolver, per provider request)
//! - Channel scoring pass: outcomes + convergence log → `channel_scores` and
//!   the detector's score book
//! - Recalibration cycle: stored history → weight search → `WeightRegistry`

use super::backtest::reconstruct_history;
use super::channel_scorer::ChannelQualityScorer;
use super::convergence::{ConvergenceDetector, FirstMoverLedger};
use super::db::SignalStore;
use super::error::{PipelineError, PipelineResult};
use super::recalibrate::{recalibrate, Recalibration, RecalibrationConfig};
use super::resolver::OutcomeResolver;
use super::types::{CallEvent, CallKey, CallOutcome, ResolutionState};
use super::weights::{WeightAuditRecord, WeightRegistry};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};

/// What happened to one outcome during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Advanced,
    Unchanged,
    Unavailable,
    Failed,
}

/// Counts for one resolver pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub scanned: usize,
    pub advanced: usize,
    pub unchanged: usize,
    pub unavailable: usize,
    pub failed: usize,
}

impl PassSummary {
    fn record(&mut self, status: ResolveStatus) {
        match status {
            ResolveStatus::Advanced => self.advanced += 1,
            ResolveStatus::Unchanged => self.unchanged += 1,
            ResolveStatus::Unavailable => self.unavailable += 1,
            ResolveStatus::Failed => self.failed += 1,
        }
    }
}

/// Rebuild the call an outcome belongs to
pub fn event_from_outcome(outcome: &CallOutcome) -> CallEvent {
    let mut event = CallEvent::new(&outcome.source_id, outcome.token.clone(), outcome.mention_timestamp);
    if outcome.platform != "unknown" {
        event.platform = Some(outcome.platform.clone());
    }
    event.narrative_tags = outcome.narrative_tags.clone();
    event
}

/// Bounded worker pool over the outcome resolver
pub struct ResolverPool {
    resolver: Arc<OutcomeResolver>,
    store: Arc<dyn SignalStore>,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<CallKey>>,
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl ResolverPool {
    pub fn new(
        resolver: Arc<OutcomeResolver>,
        store: Arc<dyn SignalStore>,
        max_concurrency: usize,
    ) -> Self {
        Self::new_with_timestamp_fn(resolver, store, max_concurrency, Box::new(Utc::now))
    }

    /// Create a pool with a custom timestamp function
    pub fn new_with_timestamp_fn(
        resolver: Arc<OutcomeResolver>,
        store: Arc<dyn SignalStore>,
        max_concurrency: usize,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            resolver,
            store,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Mutex::new(HashSet::new()),
            now_fn,
        }
    }

    /// Resolve every stored outcome that can still change
    ///
    /// Outcomes already being resolved by an overlapping pass are skipped.
    pub async fn run_pass(self: &Arc<Self>) -> PipelineResult<PassSummary> {
        let now = (self.now_fn)();
        let outcomes = self.store.latest_outcomes().await?;

        let due: Vec<CallOutcome> = {
            let mut in_flight = self.in_flight.lock().map_err(|_| PipelineError::LockPoisoned)?;
            outcomes
                .into_iter()
                .filter(|o| self.resolver.needs_work(o, now))
                .filter(|o| in_flight.insert(o.key()))
                .collect()
        };

        let mut summary = PassSummary {
            scanned: due.len(),
            ..PassSummary::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        let mut tasks = JoinSet::new();
        for prior in due {
            let pool = Arc::clone(self);
            tasks.spawn(async move {
                let key = prior.key();
                let status = match pool.permits.clone().acquire_owned().await {
                    Ok(_permit) => pool.resolve_one(prior, now).await,
                    Err(_) => ResolveStatus::Failed,
                };
                pool.in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                status
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(status) => summary.record(status),
                Err(e) => {
                    log::error!("❌ Resolver task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        log::info!(
            "📊 Resolver pass: {} due | {} advanced | {} unchanged | {} unavailable | {} failed",
            summary.scanned,
            summary.advanced,
            summary.unchanged,
            summary.unavailable,
            summary.failed
        );
        Ok(summary)
    }

    async fn resolve_one(&self, prior: CallOutcome, now: DateTime<Utc>) -> ResolveStatus {
        let event = event_from_outcome(&prior);

        let next = match self.resolver.resolve(&event, Some(&prior), now).await {
            Ok(next) if next.version == prior.version => return ResolveStatus::Unchanged,
            Ok(next) => next,
            Err(PipelineError::DataUnavailable { .. }) => {
                // Terminal: park the call so it is never re-enqueued
                let mut parked = prior.clone();
                parked.state = ResolutionState::Unresolved;
                parked.version = prior.version + 1;
                parked.resolved_at = now;
                return match self.store.append_outcome(&parked).await {
                    Ok(()) => ResolveStatus::Unavailable,
                    Err(e) => {
                        log::error!("❌ Failed to park call {}: {}", prior.key(), e);
                        ResolveStatus::Failed
                    }
                };
            }
            Err(e) => {
                log::error!("❌ Failed to resolve call {}: {}", prior.key(), e);
                return ResolveStatus::Failed;
            }
        };

        match self.store.append_outcome(&next).await {
            Ok(()) => {
                log::debug!(
                    "✅ {} → {} v{}",
                    next.key(),
                    next.state.as_str(),
                    next.version
                );
                ResolveStatus::Advanced
            }
            Err(e) => {
                log::error!("❌ Failed to store outcome {}: {}", next.key(), e);
                ResolveStatus::Failed
            }
        }
    }
}

/// Resolver scheduler task - periodically re-enqueue unresolved outcomes
///
/// This function runs indefinitely until cancelled.
pub async fn resolver_scheduler_task(pool: Arc<ResolverPool>, retry_interval_ms: u64) {
    log::info!("⏰ Starting resolver scheduler (interval: {}ms)", retry_interval_ms);

    let mut timer = interval(Duration::from_millis(retry_interval_ms));
    loop {
        timer.tick().await;
        if let Err(e) = pool.run_pass().await {
            log::error!("❌ Resolver pass failed: {}", e);
        }
    }
}

/// One channel scoring pass
///
/// Grades every source from the latest outcomes and the convergence log,
/// replaces the stored scores wholesale and swaps the detector's score book.
///
/// # Returns
/// * `Ok(n)` - Number of sources graded
pub async fn run_channel_scoring(
    store: &dyn SignalStore,
    detector: &ConvergenceDetector,
    scorer: &ChannelQualityScorer,
    now: DateTime<Utc>,
) -> PipelineResult<usize> {
    let outcomes = store.latest_outcomes().await?;
    let records = store.load_convergence_records().await?;
    let ledger = FirstMoverLedger::from_records(&records);

    let scores = scorer.score_all(&outcomes, &ledger, now);
    store.replace_channel_scores(&scores).await?;

    let count = scores.len();
    let graded = scores.iter().filter(|s| s.has_data()).count();
    detector.replace_channel_scores(scores);

    log::info!(
        "📊 Channel scoring: {} sources ({} with resolved calls, {} episodes)",
        count,
        graded,
        ledger.episodes()
    );
    Ok(count)
}

/// Channel scoring task - periodically regrade every source
///
/// This function runs indefinitely until cancelled.
pub async fn channel_scoring_task(
    store: Arc<dyn SignalStore>,
    detector: Arc<ConvergenceDetector>,
    scorer: ChannelQualityScorer,
    scoring_interval_ms: u64,
) {
    log::info!("⏰ Starting channel scoring (interval: {}ms)", scoring_interval_ms);

    let mut timer = interval(Duration::from_millis(scoring_interval_ms));
    loop {
        timer.tick().await;
        if let Err(e) = run_channel_scoring(store.as_ref(), &detector, &scorer, Utc::now()).await {
            log::error!("❌ Channel scoring failed: {}", e);
        }
    }
}

/// One recalibration cycle over the stored history
///
/// # Returns
/// * `Ok(Some(record))` - New weights installed and persisted
/// * `Ok(None)` - Current weights kept
/// * `Err(InsufficientHistory)` - Too few outcomes; nothing changed
pub async fn run_recalibration(
    store: &dyn SignalStore,
    registry: &WeightRegistry,
    config: &RecalibrationConfig,
    convergence_window: chrono::Duration,
    now: DateTime<Utc>,
) -> PipelineResult<Option<WeightAuditRecord>> {
    let outcomes = store.latest_outcomes().await?;
    let platform_tokens = store.load_platform_tokens().await?;
    let history = reconstruct_history(&outcomes, &platform_tokens, convergence_window);

    let result = recalibrate(&history, &registry.current(), now, config)?;
    install_recalibration(store, registry, &result, now).await
}

/// Persist the winner of a recalibration run, then make it active
///
/// The weights row and audit row are written before the registry swaps, so a
/// failed write leaves the running vector and the store in agreement.
///
/// # Returns
/// * `Ok(Some(record))` - New weights persisted and installed
/// * `Ok(None)` - The run kept the current vector
pub async fn install_recalibration(
    store: &dyn SignalStore,
    registry: &WeightRegistry,
    result: &Recalibration,
    now: DateTime<Utc>,
) -> PipelineResult<Option<WeightAuditRecord>> {
    let Some(record) = result.proposal(registry, now)? else {
        return Ok(None);
    };
    store.save_weights(&record).await?;
    registry.commit(record).map(Some)
}

/// Recalibration task - periodically search for better weights
///
/// This function runs indefinitely until cancelled.
pub async fn recalibration_task(
    store: Arc<dyn SignalStore>,
    registry: Arc<WeightRegistry>,
    config: RecalibrationConfig,
    convergence_window: chrono::Duration,
    interval_secs: u64,
) {
    log::info!("⏰ Starting recalibration cycle (interval: {}s)", interval_secs);

    let mut timer = interval(Duration::from_secs(interval_secs));
    // First tick fires immediately; the first cycle waits a full interval
    timer.tick().await;
    loop {
        timer.tick().await;
        match run_recalibration(store.as_ref(), &registry, &config, convergence_window, Utc::now())
            .await
        {
            Ok(Some(record)) => log::info!("✅ Weights v{} persisted", record.after.version),
            Ok(None) => {}
            Err(e) if e.is_skippable() => log::warn!("⚠️  Recalibration declined: {}", e),
            Err(e) => log::error!("❌ Recalibration failed: {}", e),
        }
    }
}

//! Pipeline Engine - per-call orchestration
//!
//! ```text
//! CallEvent
//!     ↓
//! PipelineEngine::process_event()
//!     ├─► SignalStore (pending CallOutcome for the resolver pool)
//!     ├─► ConvergenceDetector::observe()  → Option<ConvergenceSignal>
//!     ├─► ScoringInputsProvider::inputs() → ExternalInputs
//!     ↓
//! compose(inputs + tg_signal, WeightRegistry::current(), TierLadder)
//!     ↓
//! CompositeScore ─► SignalStore ─► AlertSink (tier ≥ alert tier)
//! ```
//!
//! The engine holds no lock of its own; every component it drives is safe to
//! share, so one `Arc<PipelineEngine>` serves the ingestion loop and tests alike.

use super::alerts::{Alert, AlertSink};
use super::composite::{compose, CompositeScore, SubScores, Tier, TierLadder};
use super::convergence::ConvergenceDetector;
use super::db::SignalStore;
use super::error::PipelineResult;
use super::inputs::ScoringInputsProvider;
use super::types::{CallEvent, CallOutcome, ConvergenceSignal, MarketSnapshot};
use super::weights::WeightRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Scoring snapshots this close to the mention are treated as mention-time data
const MENTION_SNAPSHOT_TOLERANCE_SECS: i64 = 300;

/// What one event produced
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub convergence: Option<ConvergenceSignal>,
    pub composite: Option<CompositeScore>,
    pub alert: Option<Alert>,
}

pub struct PipelineEngine {
    detector: Arc<ConvergenceDetector>,
    weights: Arc<WeightRegistry>,
    inputs: Arc<dyn ScoringInputsProvider>,
    alerts: Arc<dyn AlertSink>,
    ladder: TierLadder,
    alert_min_tier: Tier,

    /// Optional so the engine can run purely in memory
    store: Option<Arc<dyn SignalStore>>,

    /// Timestamp function (for testing with mock time)
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl PipelineEngine {
    /// Create an engine stamping composites with wall-clock time
    pub fn new(
        detector: Arc<ConvergenceDetector>,
        weights: Arc<WeightRegistry>,
        inputs: Arc<dyn ScoringInputsProvider>,
        alerts: Arc<dyn AlertSink>,
        ladder: TierLadder,
        alert_min_tier: Tier,
    ) -> Self {
        Self::new_with_timestamp_fn(
            detector,
            weights,
            inputs,
            alerts,
            ladder,
            alert_min_tier,
            Box::new(Utc::now),
        )
    }

    /// Create an engine with a custom timestamp function
    ///
    /// Used for testing with deterministic timestamps.
    pub fn new_with_timestamp_fn(
        detector: Arc<ConvergenceDetector>,
        weights: Arc<WeightRegistry>,
        inputs: Arc<dyn ScoringInputsProvider>,
        alerts: Arc<dyn AlertSink>,
        ladder: TierLadder,
        alert_min_tier: Tier,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            detector,
            weights,
            inputs,
            alerts,
            ladder,
            alert_min_tier,
            store: None,
            now_fn,
        }
    }

    /// Persist pending outcomes and composite snapshots to `store`
    pub fn with_store(mut self, store: Arc<dyn SignalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn detector(&self) -> &Arc<ConvergenceDetector> {
        &self.detector
    }

    pub fn weights(&self) -> &Arc<WeightRegistry> {
        &self.weights
    }

    pub fn store(&self) -> Option<&Arc<dyn SignalStore>> {
        self.store.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_fn)()
    }

    /// Flush buffered alerts; failures are logged
    pub async fn flush_alerts(&self) {
        if let Err(e) = self.alerts.flush().await {
            log::error!("❌ Failed to flush {} alerts: {}", self.alerts.sink_type(), e);
        }
    }

    /// Run one call through convergence, scoring and alerting
    ///
    /// Store and sink failures are logged and do not fail the event. An
    /// unscoreable token (`DataUnavailable`, or no inputs yet) yields an
    /// output without a composite.
    ///
    /// # Returns
    /// * `Ok(output)` - Whatever the event produced
    /// * `Err(...)` - Inputs provider failed for a non-skippable reason
    pub async fn process_event(&self, event: &CallEvent) -> PipelineResult<EngineOutput> {
        let now = self.now();
        let inputs = self.inputs.inputs(event, now).await;
        let snapshot = match &inputs {
            Ok(Some(found)) => found.market_snapshot.as_ref(),
            _ => None,
        };
        self.record_pending(event, snapshot, now).await;

        let convergence = self.detector.observe(event);
        let tg_signal = self.tg_signal(event, convergence.as_ref());

        let mut output = EngineOutput {
            convergence,
            ..EngineOutput::default()
        };

        let inputs = match inputs {
            Ok(Some(inputs)) => inputs,
            Ok(None) => {
                log::debug!("⏭️  No scoring inputs yet for {}, skipped", event.token);
                return Ok(output);
            }
            Err(e) if e.is_skippable() => {
                log::warn!("⚠️  {} not scoreable: {}", event.token, e);
                return Ok(output);
            }
            Err(e) => return Err(e),
        };

        let weights = self.weights.current();
        let composite = compose(
            &event.token,
            now,
            &inputs.with_tg_signal(tg_signal),
            &weights,
            &self.ladder,
        );

        log::debug!(
            "📊 {} scored {:.1} ({}) with weights v{}",
            composite.token,
            composite.total,
            composite.tier.as_str(),
            composite.weights.version
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.append_composite(&composite).await {
                log::error!("❌ Failed to store composite for {}: {}", composite.token, e);
            }
        }

        if composite.tier != Tier::Untiered && composite.tier.at_least(self.alert_min_tier) {
            let alert = Alert::new(composite.clone(), output.convergence.clone());
            if let Err(e) = self.alerts.send(&alert).await {
                log::error!("❌ Alert sink {} failed: {}", self.alerts.sink_type(), e);
            }
            output.alert = Some(alert);
        }

        output.composite = Some(composite);
        Ok(output)
    }

    /// Convergence input: the emitted signal's confidence, else the current
    /// window's confidence once two sources are present, else 0
    fn tg_signal(&self, event: &CallEvent, convergence: Option<&ConvergenceSignal>) -> f64 {
        if let Some(signal) = convergence {
            return SubScores::tg_signal_from_confidence(signal.confidence);
        }
        let sources = self.detector.window_sources(&event.token);
        if sources.len() < 2 {
            return 0.0;
        }
        let book = self.detector.score_book();
        let confidence = self
            .detector
            .confidence(sources.iter().map(|s| s.as_str()), &book);
        SubScores::tg_signal_from_confidence(confidence)
    }

    /// First sighting of a call becomes a version-0 pending outcome
    ///
    /// A live snapshot taken within `MENTION_SNAPSHOT_TOLERANCE_SECS` of the
    /// mention supplies mcap, holders and a missing platform. Historical
    /// snapshots carry no mcap, so this is the only reliable chance to get it.
    async fn record_pending(
        &self,
        event: &CallEvent,
        snapshot: Option<&MarketSnapshot>,
        now: DateTime<Utc>,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        match store.latest_outcome(&event.key()).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let mut pending = CallOutcome::pending(event, now);
                let at_mention =
                    (now - event.timestamp).num_seconds().abs() <= MENTION_SNAPSHOT_TOLERANCE_SECS;
                if let Some(s) = snapshot.filter(|_| at_mention) {
                    pending.mcap_at_mention = s.mcap;
                    pending.holders_at_mention = s.holders;
                    if event.platform.is_none() {
                        if let Some(platform) = &s.platform {
                            pending.platform = platform.clone();
                        }
                    }
                }
                if let Err(e) = store.append_outcome(&pending).await {
                    log::error!("❌ Failed to record call {}: {}", event.key(), e);
                }
            }
            Err(e) => log::error!("❌ Failed to look up call {}: {}", event.key(), e),
        }
    }
}

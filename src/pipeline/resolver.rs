//! Outcome Resolver - realized price history for each call
//!
//! Resolution is re-entrant. Every call to [`OutcomeResolver::resolve`] takes
//! the latest stored outcome, requests only the samples it still lacks and
//! returns the next version:
//!
//! ```text
//! Pending ──► PartiallyResolved ──► Resolved ──► (later peak) Resolved v+1
//!    │               │
//!    └───────────────┴──► Unresolved   (max staleness reached, samples missing)
//! ```
//!
//! Fixed-offset samples are requested once each. Peak discovery keeps running
//! until the peak horizon; a later peak supersedes the outcome with a higher
//! version instead of mutating it.

use super::backoff::{ExponentialBackoff, RequestSpacer};
use super::error::PipelineError;
use super::market_data::{MarketDataError, MarketDataProvider};
use super::types::{CallEvent, CallOutcome, ResolutionState};
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;

/// Offsets after the mention at which fixed samples are taken
pub const SAMPLE_OFFSETS_HOURS: [i64; 4] = [0, 1, 6, 24];

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Peak search stops this long after the mention
    pub peak_horizon: Duration,
    /// Missing fixed samples become permanently unresolved after this age
    pub max_staleness: Duration,
    /// A new peak must exceed the stored one by this fraction
    pub min_peak_rise: f64,
    /// A new peak must be at least this much later than the stored one
    pub min_peak_interval: Duration,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            peak_horizon: Duration::hours(72),
            max_staleness: Duration::hours(72),
            min_peak_rise: 0.01,
            min_peak_interval: Duration::seconds(60),
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            retry_max_attempts: 3,
        }
    }
}

/// Resolves call events into versioned outcomes against a market data provider
pub struct OutcomeResolver {
    provider: Arc<dyn MarketDataProvider>,
    config: ResolverConfig,
    spacer: RequestSpacer,
}

impl OutcomeResolver {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: ResolverConfig) -> Self {
        Self {
            provider,
            config,
            spacer: RequestSpacer::new(0),
        }
    }

    /// Keep at least `spacing_ms` between any two provider requests, retries included
    pub fn with_request_spacing(mut self, spacing_ms: u64) -> Self {
        self.spacer = RequestSpacer::new(spacing_ms);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Advance the outcome of `event` as far as data available at `now` allows
    ///
    /// # Arguments
    /// * `event` - The call being resolved
    /// * `prior` - Latest stored outcome for this call, if any
    /// * `now` - Current time; offsets later than this are not requested
    ///
    /// # Returns
    /// * `Ok(outcome)` - The next outcome. Its `version` is higher than the
    ///   prior's only when something observable changed.
    /// * `Err(DataUnavailable)` - The provider does not know the token; terminal
    ///
    /// Transient provider failures are retried with backoff. Once retries are
    /// exhausted, samples fetched before the failure are kept and the rest is
    /// left for the next schedule.
    pub async fn resolve(
        &self,
        event: &CallEvent,
        prior: Option<&CallOutcome>,
        now: DateTime<Utc>,
    ) -> Result<CallOutcome, PipelineError> {
        let baseline = prior
            .cloned()
            .unwrap_or_else(|| CallOutcome::pending(event, now));

        if !self.needs_work(&baseline, now) {
            return Ok(baseline);
        }

        let mut next = baseline.clone();
        let mut peak_candidates = Vec::new();
        let exhausted = match self.advance(event, &mut next, &mut peak_candidates, now).await {
            Ok(()) => false,
            Err(MarketDataError::UnknownToken(token)) => {
                log::warn!(
                    "⚠️  Token {} unknown to {}, call {} excluded from scoring",
                    token,
                    self.provider.provider_name(),
                    event.key()
                );
                return Err(PipelineError::DataUnavailable {
                    token,
                    reason: format!("unknown to {}", self.provider.provider_name()),
                });
            }
            Err(MarketDataError::Transient(msg)) => {
                log::warn!(
                    "⚠️  Market data retries exhausted for {}: {} (keeping samples fetched so far)",
                    event.key(),
                    msg
                );
                true
            }
        };

        self.settle_peak(&mut next, peak_candidates);
        next.state = self.classify(&next, now);

        match prior {
            Some(p) if same_observations(p, &next) => Ok(p.clone()),
            None if exhausted && same_observations(&baseline, &next) => Ok(baseline),
            Some(p) => {
                next.version = p.version + 1;
                next.resolved_at = now;
                Ok(next)
            }
            None => {
                next.version = 1;
                next.resolved_at = now;
                Ok(next)
            }
        }
    }

    /// True while the outcome can still change
    pub fn needs_work(&self, outcome: &CallOutcome, now: DateTime<Utc>) -> bool {
        match outcome.state {
            ResolutionState::Unresolved => false,
            ResolutionState::Resolved => now < outcome.mention_timestamp + self.config.peak_horizon,
            ResolutionState::Pending | ResolutionState::PartiallyResolved => true,
        }
    }

    /// Fetch missing samples into `next` and collect live peak candidates
    ///
    /// Every sample is written as soon as it arrives, so an error part way
    /// through leaves the earlier ones in place.
    async fn advance(
        &self,
        event: &CallEvent,
        next: &mut CallOutcome,
        peak_candidates: &mut Vec<(f64, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Result<(), MarketDataError> {
        let mention = next.mention_timestamp;
        let token = event.token.clone();

        // Mention-time snapshot carries mcap / holders / platform as well
        if next.price_at_mention.is_none() {
            let snapshot = self
                .with_retry(|| self.provider.get_snapshot(&token, mention))
                .await?;
            if let Some(s) = snapshot {
                next.price_at_mention = valid_price(s.price);
                next.mcap_at_mention = next.mcap_at_mention.or(s.mcap);
                next.holders_at_mention = next.holders_at_mention.or(s.holders);
                if event.platform.is_none() {
                    if let Some(platform) = s.platform {
                        next.platform = platform;
                    }
                }
            }
        }

        for hours in &SAMPLE_OFFSETS_HOURS[1..] {
            let at = mention + Duration::hours(*hours);
            if at > now || sample_slot(next, *hours).is_some() {
                continue;
            }
            let price = self
                .with_retry(|| self.provider.get_price(&token, at))
                .await?
                .and_then(valid_price);
            *sample_slot(next, *hours) = price;
        }

        let horizon_end = mention + self.config.peak_horizon;
        if now < horizon_end {
            let current = self
                .with_retry(|| self.provider.get_price(&token, now))
                .await?
                .and_then(valid_price);
            if let Some(price) = current {
                peak_candidates.push((price, now));
            }
        }

        let history_end = std::cmp::min(now, horizon_end);
        if history_end > mention {
            let history = self
                .with_retry(|| self.provider.price_history(&token, mention, history_end))
                .await?;
            peak_candidates.extend(
                history
                    .into_iter()
                    .filter_map(|p| valid_price(p.price).map(|price| (price, p.timestamp))),
            );
        }
        Ok(())
    }

    /// Offer fixed samples and live candidates to the peak in time order, then
    /// recompute the ROI
    fn settle_peak(&self, next: &mut CallOutcome, live: Vec<(f64, DateTime<Utc>)>) {
        let mention = next.mention_timestamp;
        let horizon_end = mention + self.config.peak_horizon;

        let mut candidates: Vec<(f64, DateTime<Utc>)> = SAMPLE_OFFSETS_HOURS
            .iter()
            .filter_map(|h| {
                let price = match h {
                    0 => next.price_at_mention,
                    1 => next.price_1h,
                    6 => next.price_6h,
                    _ => next.price_24h,
                }?;
                Some((price, mention + Duration::hours(*h)))
            })
            .chain(live)
            .collect();

        candidates.retain(|(_, ts)| *ts >= mention && *ts <= horizon_end);
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.total_cmp(&b.0)));

        for (price, ts) in candidates {
            self.offer_peak(next, price, ts);
        }

        next.roi_if_sold_at_peak = CallOutcome::compute_roi(next.price_at_mention, next.price_peak);
    }

    /// Apply the peak update rule to one candidate
    ///
    /// Price and timestamp always move together. A candidate only replaces the
    /// stored peak when it is higher by `min_peak_rise` AND at least
    /// `min_peak_interval` later.
    pub fn offer_peak(&self, outcome: &mut CallOutcome, price: f64, ts: DateTime<Utc>) -> bool {
        match (outcome.price_peak, outcome.peak_timestamp) {
            (Some(peak), Some(peak_ts)) => {
                let higher = price > peak * (1.0 + self.config.min_peak_rise);
                let later = ts >= peak_ts + self.config.min_peak_interval;
                if higher && later {
                    outcome.price_peak = Some(price);
                    outcome.peak_timestamp = Some(ts);
                    true
                } else {
                    false
                }
            }
            _ => {
                outcome.price_peak = Some(price);
                outcome.peak_timestamp = Some(ts);
                true
            }
        }
    }

    fn classify(&self, outcome: &CallOutcome, now: DateTime<Utc>) -> ResolutionState {
        if outcome.has_all_fixed_samples() {
            // Zero mention price leaves the ROI undefined for good
            if outcome.roi_if_sold_at_peak.is_some() {
                return ResolutionState::Resolved;
            }
            return ResolutionState::Unresolved;
        }
        if now > outcome.mention_timestamp + self.config.max_staleness {
            return ResolutionState::Unresolved;
        }
        if outcome.has_any_sample() {
            ResolutionState::PartiallyResolved
        } else {
            ResolutionState::Pending
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, MarketDataError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MarketDataError>>,
    {
        let mut backoff = ExponentialBackoff::new(
            self.config.retry_initial_delay_ms,
            self.config.retry_max_delay_ms,
            self.config.retry_max_attempts,
        );

        loop {
            self.spacer.wait().await;
            match op().await {
                Err(MarketDataError::Transient(msg)) => {
                    log::debug!("🔄 Transient market data error: {}", msg);
                    if backoff.sleep().await.is_err() {
                        return Err(MarketDataError::Transient(msg));
                    }
                }
                other => return other,
            }
        }
    }
}

fn valid_price(price: f64) -> Option<f64> {
    (price.is_finite() && price >= 0.0).then_some(price)
}

fn sample_slot(outcome: &mut CallOutcome, hours: i64) -> &mut Option<f64> {
    match hours {
        0 => &mut outcome.price_at_mention,
        1 => &mut outcome.price_1h,
        6 => &mut outcome.price_6h,
        _ => &mut outcome.price_24h,
    }
}

/// Equal apart from bookkeeping fields
fn same_observations(a: &CallOutcome, b: &CallOutcome) -> bool {
    let mut a = a.clone();
    a.version = b.version;
    a.resolved_at = b.resolved_at;
    a == *b
}

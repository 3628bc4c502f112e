//! Convergence Detector - independent sources calling the same token
//!
//! Keeps a time-bounded window of `(timestamp, source_id)` entries per token.
//! Windows are sharded in a `DashMap`: events for the same token serialize on
//! the shard's entry lock, events for distinct tokens proceed in parallel.
//!
//! ## Emission rule
//!
//! On each event:
//! 1. Evict entries older than the window (relative to the newest event seen)
//! 2. Insert the entry in `(timestamp, source_id)` order
//! 3. If the event introduced a source not already in the window and at least
//!    two distinct sources remain, emit a `ConvergenceSignal`
//!
//! Repeat calls from a source already in the window never emit. Idle windows
//! are reclaimed by [`ConvergenceDetector::collect_idle`].

use super::channel_scorer::{quality_weight, QualityWeightParams};
use super::types::{CallEvent, ChannelScore, ConvergenceRecord, ConvergenceSignal, TokenIdentity};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct TokenWindow {
    /// Sorted by (timestamp, source_id)
    entries: Vec<(DateTime<Utc>, String)>,
    /// Newest event time seen for this token
    latest: DateTime<Utc>,
}

impl TokenWindow {
    fn new(latest: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            latest,
        }
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        self.entries.retain(|(ts, _)| *ts >= cutoff);
    }

    fn contains(&self, source_id: &str) -> bool {
        self.entries.iter().any(|(_, s)| s == source_id)
    }

    fn insert(&mut self, ts: DateTime<Utc>, source_id: &str) {
        let entry = (ts, source_id.to_string());
        let pos = self.entries.partition_point(|e| *e <= entry);
        self.entries.insert(pos, entry);
    }

    /// Distinct sources with their first timestamp, earliest first
    fn contributors(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|(_, s)| seen.insert(s.as_str()))
            .map(|(ts, s)| (s.clone(), *ts))
            .collect()
    }
}

pub struct ConvergenceDetector {
    window: Duration,
    params: QualityWeightParams,
    windows: DashMap<TokenIdentity, TokenWindow>,
    score_book: ArcSwap<HashMap<String, ChannelScore>>,
    records: Mutex<Vec<ConvergenceRecord>>,
}

impl ConvergenceDetector {
    pub fn new(window: Duration, params: QualityWeightParams) -> Self {
        Self {
            window,
            params,
            windows: DashMap::new(),
            score_book: ArcSwap::from_pointee(HashMap::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Feed one call event; returns a signal when a new distinct source converges
    pub fn observe(&self, event: &CallEvent) -> Option<ConvergenceSignal> {
        let book = self.score_book.load();

        let record = {
            let mut window = self
                .windows
                .entry(event.token.clone())
                .or_insert_with(|| TokenWindow::new(event.timestamp));

            let now = std::cmp::max(window.latest, event.timestamp);
            window.latest = now;
            window.evict_before(now - self.window);

            if now - event.timestamp > self.window {
                log::debug!(
                    "⏭️  Late call from {} for {} outside window, ignored",
                    event.source_id,
                    event.token
                );
                return None;
            }

            let already_present = window.contains(&event.source_id);
            window.insert(event.timestamp, &event.source_id);
            if already_present {
                return None;
            }

            let contributors = window.contributors();
            if contributors.len() < 2 {
                return None;
            }

            ConvergenceRecord {
                token: event.token.clone(),
                episode_start: contributors[0].1,
                contributors,
                recorded_at: event.timestamp,
            }
        }; // Entry lock released here

        let confidence = self.confidence(
            record.contributors.iter().map(|(s, _)| s.as_str()),
            &book,
        );
        let signal = ConvergenceSignal {
            token: record.token.clone(),
            contributing_sources: record.contributors.iter().map(|(s, _)| s.clone()).collect(),
            confidence,
            generated_at: event.timestamp,
        };

        log::info!(
            "🔀 Convergence on {}: {} sources (confidence {:.3})",
            signal.token,
            signal.contributing_sources.len(),
            signal.confidence
        );

        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);

        Some(signal)
    }

    /// `Σ w(window sources) / Σ w(known ∪ window sources)`
    ///
    /// Sources missing from the score book weigh the default quality weight.
    pub fn confidence<'a, I>(&self, window_sources: I, book: &HashMap<String, ChannelScore>) -> f64
    where
        I: IntoIterator<Item = &'a str>,
    {
        let weight_of = |source: &str| {
            book.get(source)
                .map(|s| quality_weight(s, &self.params))
                .unwrap_or(self.params.default_weight)
        };

        let mut numerator = 0.0;
        let mut unknown_extra = 0.0;
        for source in window_sources {
            let w = weight_of(source);
            numerator += w;
            if !book.contains_key(source) {
                unknown_extra += w;
            }
        }

        let known: f64 = book.values().map(|s| quality_weight(s, &self.params)).sum();
        let denominator = known + unknown_extra;
        if denominator <= 0.0 {
            return 0.0;
        }
        (numerator / denominator).clamp(0.0, 1.0)
    }

    /// Swap in the scores of the latest scoring pass
    pub fn replace_channel_scores(&self, scores: Vec<ChannelScore>) {
        let book: HashMap<String, ChannelScore> = scores
            .into_iter()
            .map(|s| (s.source_id.clone(), s))
            .collect();
        log::debug!("🔄 Convergence score book replaced ({} sources)", book.len());
        self.score_book.store(Arc::new(book));
    }

    pub fn score_book(&self) -> Arc<HashMap<String, ChannelScore>> {
        self.score_book.load_full()
    }

    /// Drop expired entries and whole windows idle for longer than the window
    ///
    /// Returns the number of token windows reclaimed.
    pub fn collect_idle(&self, now: DateTime<Utc>) -> usize {
        let window = self.window;
        let mut reclaimed = 0;
        self.windows.retain(|_, w| {
            w.evict_before(now - window);
            let keep = !w.entries.is_empty() && now - w.latest <= window;
            if !keep {
                reclaimed += 1;
            }
            keep
        });
        reclaimed
    }

    /// Convergence records accumulated since the last drain
    pub fn drain_records(&self) -> Vec<ConvergenceRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Put back records whose write failed, ahead of anything recorded since
    pub fn requeue_records(&self, mut failed: Vec<ConvergenceRecord>) {
        if failed.is_empty() {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        failed.append(&mut records);
        *records = failed;
    }

    pub fn active_tokens(&self) -> usize {
        self.windows.len()
    }

    /// Distinct sources currently in the token's window, earliest first
    pub fn window_sources(&self, token: &TokenIdentity) -> Vec<String> {
        self.windows
            .get(token)
            .map(|w| w.contributors().into_iter().map(|(s, _)| s).collect())
            .unwrap_or_default()
    }
}

/// First-mover attribution built from the convergence log
///
/// Records sharing a token and episode start are one episode; the record
/// with the most contributors describes it.
#[derive(Debug, Clone, Default)]
pub struct FirstMoverLedger {
    /// source → (episodes led, episodes participated)
    tallies: HashMap<String, (u32, u32)>,
    episodes: usize,
}

impl FirstMoverLedger {
    pub fn from_records(records: &[ConvergenceRecord]) -> Self {
        let mut episodes: HashMap<(&TokenIdentity, DateTime<Utc>), &ConvergenceRecord> =
            HashMap::new();
        for record in records {
            episodes
                .entry((&record.token, record.episode_start))
                .and_modify(|current| {
                    if record.contributors.len() > current.contributors.len() {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let mut tallies: HashMap<String, (u32, u32)> = HashMap::new();
        for record in episodes.values() {
            let first = record.first_source();
            for (source, _) in &record.contributors {
                let tally = tallies.entry(source.clone()).or_insert((0, 0));
                tally.1 += 1;
                if Some(source.as_str()) == first {
                    tally.0 += 1;
                }
            }
        }

        Self {
            tallies,
            episodes: episodes.len(),
        }
    }

    /// Fraction of the source's episodes it was earliest in; `None` if it took part in none
    pub fn score(&self, source_id: &str) -> Option<f64> {
        self.tallies
            .get(source_id)
            .filter(|(_, participated)| *participated > 0)
            .map(|(led, participated)| *led as f64 / *participated as f64)
    }

    pub fn episodes(&self) -> usize {
        self.episodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn make_event(source: &str, token: &str, minute: i64) -> CallEvent {
        CallEvent::new(
            source,
            TokenIdentity::new("solana", token),
            base_time() + Duration::minutes(minute),
        )
    }

    fn make_detector() -> ConvergenceDetector {
        ConvergenceDetector::new(Duration::hours(2), QualityWeightParams::default())
    }

    fn make_score(source: &str, total_calls: u32, hit_rate_2x: f64) -> ChannelScore {
        let mut score = ChannelScore::insufficient(source, 0, base_time());
        score.total_calls = total_calls;
        score.hit_rate_2x = hit_rate_2x;
        score
    }

    #[test]
    fn test_single_source_never_emits() {
        let detector = make_detector();
        assert!(detector.observe(&make_event("a", "T", 0)).is_none());
        assert!(detector.observe(&make_event("a", "T", 10)).is_none());
    }

    #[test]
    fn test_expiry_and_no_refire() {
        // Test: A at 0, B at 90 converge; A expires at 125 and B alone never re-fires
        let detector = make_detector();
        assert!(detector.observe(&make_event("A", "T", 0)).is_none());

        let signal = detector.observe(&make_event("B", "T", 90)).unwrap();
        assert_eq!(signal.contributing_sources, vec!["A", "B"]);

        assert!(detector.observe(&make_event("B", "T", 125)).is_none());
        assert_eq!(
            detector.window_sources(&TokenIdentity::new("solana", "T")),
            vec!["B"]
        );
        assert!(detector.observe(&make_event("B", "T", 130)).is_none());

        // A new distinct source joins: fires again
        let signal = detector.observe(&make_event("C", "T", 140)).unwrap();
        assert_eq!(signal.contributing_sources, vec!["B", "C"]);
    }

    #[test]
    fn test_duplicate_source_not_added() {
        let detector = make_detector();
        detector.observe(&make_event("A", "T", 0));
        assert!(detector.observe(&make_event("B", "T", 5)).is_some());
        assert!(detector.observe(&make_event("A", "T", 6)).is_none());
        assert!(detector.observe(&make_event("B", "T", 7)).is_none());
    }

    #[test]
    fn test_tie_broken_by_source_id() {
        let detector = make_detector();
        detector.observe(&make_event("zeta", "T", 0));
        let signal = detector.observe(&make_event("alpha", "T", 0)).unwrap();

        assert_eq!(signal.contributing_sources, vec!["alpha", "zeta"]);
        let records = detector.drain_records();
        assert_eq!(records[0].first_source(), Some("alpha"));
    }

    #[test]
    fn test_distinct_tokens_independent() {
        let detector = make_detector();
        detector.observe(&make_event("A", "T1", 0));
        assert!(detector.observe(&make_event("B", "T2", 1)).is_none());
        assert_eq!(detector.active_tokens(), 2);
    }

    #[test]
    fn test_confidence_monotonic_as_sources_join() {
        let detector = make_detector();
        detector.replace_channel_scores(vec![
            make_score("A", 30, 0.8),
            make_score("B", 10, 0.2),
            make_score("C", 2, 0.0),
            make_score("D", 40, 0.5),
        ]);

        detector.observe(&make_event("A", "T", 0));
        let mut previous = 0.0;
        for (i, source) in ["B", "C", "D", "newcomer"].iter().enumerate() {
            let signal = detector
                .observe(&make_event(source, "T", i as i64 + 1))
                .unwrap();
            assert!(signal.confidence + 1e-12 >= previous);
            assert!((0.0..=1.0).contains(&signal.confidence));
            previous = signal.confidence;
        }
        // Every known source plus the newcomer is in the window
        assert!((previous - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_uses_default_for_unknown() {
        let detector = make_detector();
        let book = HashMap::new();
        // Two unknown sources, nothing else known
        let c = detector.confidence(["x", "y"], &book);
        assert!((c - 1.0).abs() < 1e-12);

        let mut book = HashMap::new();
        book.insert("k".to_string(), make_score("k", 20, 1.0)); // weight 1.0
        let c = detector.confidence(["x", "y"], &book);
        // 0.6 / (1.0 + 0.6)
        assert!((c - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_collect_idle_reclaims_windows() {
        let detector = make_detector();
        detector.observe(&make_event("A", "old", 0));
        detector.observe(&make_event("A", "fresh", 200));

        let reclaimed = detector.collect_idle(base_time() + Duration::minutes(210));
        assert_eq!(reclaimed, 1);
        assert_eq!(detector.active_tokens(), 1);
        assert!(detector
            .window_sources(&TokenIdentity::new("solana", "old"))
            .is_empty());
    }

    #[test]
    fn test_late_event_ignored() {
        let detector = make_detector();
        detector.observe(&make_event("A", "T", 300));
        assert!(detector.observe(&make_event("B", "T", 0)).is_none());
        assert_eq!(
            detector.window_sources(&TokenIdentity::new("solana", "T")),
            vec!["A"]
        );
    }

    #[test]
    fn test_first_mover_ledger_collapses_episodes() {
        let detector = make_detector();
        detector.observe(&make_event("A", "T", 0));
        detector.observe(&make_event("B", "T", 10));
        detector.observe(&make_event("C", "T", 20));
        detector.observe(&make_event("B", "U", 0));
        detector.observe(&make_event("C", "U", 5));

        let records = detector.drain_records();
        assert_eq!(records.len(), 3);
        assert!(detector.drain_records().is_empty());

        let ledger = FirstMoverLedger::from_records(&records);
        assert_eq!(ledger.episodes(), 2);
        assert_eq!(ledger.score("A"), Some(1.0));
        assert_eq!(ledger.score("B"), Some(0.5));
        assert_eq!(ledger.score("C"), Some(0.0));
        assert_eq!(ledger.score("nobody"), None);
    }

    #[test]
    fn test_requeued_records_come_back_first() {
        let detector = make_detector();
        detector.observe(&make_event("A", "T", 0));
        detector.observe(&make_event("B", "T", 10));
        let failed = detector.drain_records();
        assert_eq!(failed.len(), 1);

        detector.observe(&make_event("B", "U", 0));
        detector.observe(&make_event("C", "U", 5));
        detector.requeue_records(failed);

        let records = detector.drain_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].first_source(), Some("A"));
        assert_eq!(records[1].first_source(), Some("B"));
    }
}

//! Integration tests for the call-signal pipeline
//!
//! Exercises the public API end to end:
//! - Channel grading bounds and insufficient-data reporting
//! - Composite bounds under every valid weight vector
//! - Convergence windows: emission, expiry, confidence monotonicity
//! - Deterministic backtests
//! - Atomic weight replacement and rejection of invalid vectors
//! - Full flow: ingestion → resolver pool → channel scoring

#[cfg(test)]
mod pipeline_integration_tests {
    use callflow::pipeline::alerts::LogAlertSink;
    use callflow::pipeline::backtest::{backtest, reconstruct_history};
    use callflow::pipeline::channel_scorer::{ChannelQualityScorer, QualityWeightParams};
    use callflow::pipeline::composite::{compose, SubScores, Tier, TierLadder};
    use callflow::pipeline::convergence::{ConvergenceDetector, FirstMoverLedger};
    use callflow::pipeline::db::{SignalStore, SqliteSignalStore};
    use callflow::pipeline::engine::PipelineEngine;
    use callflow::pipeline::error::PipelineError;
    use callflow::pipeline::ingestion::start_pipeline_ingestion;
    use callflow::pipeline::inputs::MarketInputs;
    use callflow::pipeline::market_data::{MarketDataError, MarketDataProvider};
    use callflow::pipeline::recalibrate::candidate_vectors;
    use callflow::pipeline::resolver::{OutcomeResolver, ResolverConfig};
    use callflow::pipeline::scheduler::{run_channel_scoring, ResolverPool};
    use callflow::pipeline::types::{
        CallEvent, CallOutcome, ChannelScore, MarketSnapshot, ResolutionState, TokenIdentity,
    };
    use callflow::pipeline::weights::{
        ScoreComponent, ScoringWeights, WeightJustification, WeightRegistry,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    const T0: i64 = 1_700_000_000;

    fn at_mins(mins: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(T0, 0).unwrap() + Duration::minutes(mins)
    }

    fn make_call(source: &str, address: &str, mins: i64) -> CallEvent {
        CallEvent::new(source, TokenIdentity::new("base", address), at_mins(mins))
    }

    /// Resolved outcome with the given mention and peak prices
    fn make_resolved(source: &str, address: &str, mins: i64, mention: f64, peak: f64) -> CallOutcome {
        let event = make_call(source, address, mins);
        let mut outcome = CallOutcome::pending(&event, at_mins(mins));
        outcome.price_at_mention = Some(mention);
        outcome.price_1h = Some(mention);
        outcome.price_6h = Some(peak);
        outcome.price_24h = Some(mention);
        outcome.price_peak = Some(peak);
        outcome.peak_timestamp = Some(at_mins(mins + 360));
        outcome.mcap_at_mention = Some(200_000.0);
        outcome.roi_if_sold_at_peak = CallOutcome::compute_roi(Some(mention), Some(peak));
        outcome.state = ResolutionState::Resolved;
        outcome.version = 1;
        outcome
    }

    fn make_justification() -> WeightJustification {
        WeightJustification {
            statistic: 0.5,
            previous_statistic: Some(0.4),
            period_start: at_mins(0),
            period_end: at_mins(7 * 24 * 60),
            reason: "integration test".to_string(),
        }
    }

    /// Helper to create test database
    fn create_test_db() -> (NamedTempFile, Arc<SqliteSignalStore>) {
        let temp_file = NamedTempFile::new().unwrap();
        let schema_dir = format!("{}/sql", env!("CARGO_MANIFEST_DIR"));
        let store = Arc::new(
            SqliteSignalStore::open_with_migrations(temp_file.path().to_str().unwrap(), &schema_dir)
                .unwrap(),
        );
        (temp_file, store)
    }

    #[test]
    fn test_peak_roi_counts_toward_2x_not_5x() {
        // Test: mention 100, peak 400 → ROI 3.0
        assert_eq!(CallOutcome::compute_roi(Some(100.0), Some(400.0)), Some(3.0));

        let outcome = make_resolved("alpha", "0xaaa", 0, 100.0, 400.0);
        assert!(outcome.hit_2x());
        assert!(!outcome.hit_5x());

        let score = ChannelQualityScorer::new(5).score(
            "alpha",
            &[outcome],
            &FirstMoverLedger::from_records(&[]),
            at_mins(10_000),
        );
        assert_eq!(score.hit_rate_2x(), Some(1.0));
        assert_eq!(score.hit_rate_5x(), Some(0.0));
        assert_eq!(score.avg_roi(), Some(3.0));
    }

    #[test]
    fn test_channel_rates_bounded_and_insufficient_reported() {
        let outcomes = vec![
            make_resolved("alpha", "0xaaa", 0, 100.0, 400.0),
            make_resolved("alpha", "0xbbb", 10, 100.0, 120.0),
            make_resolved("alpha", "0xccc", 20, 100.0, 600.0),
            CallOutcome::pending(&make_call("beta", "0xaaa", 5), at_mins(5)),
        ];

        let scores: Vec<ChannelScore> = ChannelQualityScorer::new(5).score_all(
            &outcomes,
            &FirstMoverLedger::from_records(&[]),
            at_mins(10_000),
        );
        assert_eq!(scores.len(), 2);

        for score in &scores {
            for rate in [score.hit_rate_2x, score.hit_rate_5x, score.first_mover_score] {
                assert!((0.0..=1.0).contains(&rate), "{} out of range", rate);
            }
        }

        let beta = scores.iter().find(|s| s.source_id == "beta").unwrap();
        assert_eq!(beta.total_calls, 0);
        assert!(!beta.has_data());
        assert_eq!(beta.hit_rate_2x(), None);
        assert_eq!(beta.avg_roi(), None);
    }

    #[test]
    fn test_composite_bounded_for_every_valid_vector() {
        let ladder = TierLadder::default();
        let token = TokenIdentity::new("base", "0xaaa");
        let inputs = [
            SubScores::default(),
            SubScores {
                narrative: 100.0,
                profile: 100.0,
                platform: 100.0,
                market: 100.0,
                depth: 100.0,
                wallet: 100.0,
                tg_signal: 100.0,
            },
            SubScores {
                narrative: 100.0,
                profile: 0.0,
                platform: 37.5,
                market: 100.0,
                depth: 0.0,
                wallet: 12.0,
                tg_signal: 99.9,
            },
        ];

        for weights in candidate_vectors(&ScoringWeights::default(), &[0.05, 0.10]) {
            for sub in &inputs {
                let score = compose(&token, at_mins(0), sub, &weights, &ladder);
                assert!((0.0..=100.0).contains(&score.total));
            }
        }
    }

    #[test]
    fn test_convergence_emits_then_expires() {
        // Test: A at minute 0, B at minute 90, window 120 minutes
        let detector = ConvergenceDetector::new(Duration::minutes(120), QualityWeightParams::default());

        assert!(detector.observe(&make_call("A", "0xt", 0)).is_none());
        let signal = detector.observe(&make_call("B", "0xt", 90)).unwrap();
        assert_eq!(signal.contributing_sources, vec!["A", "B"]);
        assert_eq!(signal.generated_at, at_mins(90));

        // Minute 125: A has expired, a repeat from B must not re-fire
        assert!(detector.observe(&make_call("B", "0xt", 125)).is_none());
        let token = TokenIdentity::new("base", "0xt");
        assert_eq!(detector.window_sources(&token), vec!["B"]);
        assert!(detector.observe(&make_call("B", "0xt", 126)).is_none());

        // A new distinct source converges again
        let again = detector.observe(&make_call("C", "0xt", 130)).unwrap();
        assert_eq!(again.contributing_sources, vec!["B", "C"]);
    }

    #[test]
    fn test_confidence_non_decreasing_as_sources_join() {
        let detector = ConvergenceDetector::new(Duration::minutes(120), QualityWeightParams::default());
        let outcomes = vec![
            make_resolved("A", "0x1", 0, 100.0, 400.0),
            make_resolved("B", "0x2", 0, 100.0, 110.0),
            make_resolved("C", "0x3", 0, 100.0, 900.0),
        ];
        detector.replace_channel_scores(ChannelQualityScorer::new(5).score_all(
            &outcomes,
            &FirstMoverLedger::from_records(&[]),
            at_mins(10_000),
        ));

        let mut last = 0.0;
        for (i, source) in ["A", "B", "C", "D"].iter().enumerate() {
            if let Some(signal) = detector.observe(&make_call(source, "0xt", i as i64 * 10)) {
                assert!(signal.confidence + 1e-12 >= last);
                assert!((0.0..=1.0).contains(&signal.confidence));
                last = signal.confidence;
            }
        }
        assert!(last > 0.0);
    }

    #[test]
    fn test_backtest_is_deterministic() {
        let outcomes = vec![
            make_resolved("A", "0x1", 0, 100.0, 400.0),
            make_resolved("B", "0x1", 30, 100.0, 150.0),
            make_resolved("A", "0x2", 60, 100.0, 90.0),
            make_resolved("C", "0x3", 90, 100.0, 700.0),
        ];
        let candidates = vec![
            ScoringWeights::default(),
            ScoringWeights::from_array([0.15, 0.15, 0.15, 0.15, 0.10, 0.10, 0.20], 2),
        ];

        let first = backtest(
            &reconstruct_history(&outcomes, &[], Duration::hours(2)),
            &candidates,
            &TierLadder::default(),
        );
        let second = backtest(
            &reconstruct_history(&outcomes, &[], Duration::hours(2)),
            &candidates,
            &TierLadder::default(),
        );
        assert_eq!(first, second);
        assert_eq!(first.samples, 4);
        assert_eq!(first.candidates.len(), 2);
    }

    #[test]
    fn test_replacement_visible_to_next_compose() {
        let registry = WeightRegistry::default();
        let token = TokenIdentity::new("base", "0xaaa");
        let sub = SubScores {
            tg_signal: 100.0,
            ..SubScores::default()
        };

        let before = compose(&token, at_mins(0), &sub, &registry.current(), &TierLadder::default());
        assert_eq!(before.total, 15.0);

        let heavier = ScoringWeights::default()
            .with(ScoreComponent::Narrative, 0.10)
            .with(ScoreComponent::TgSignal, 0.25);
        registry
            .replace(heavier, make_justification(), at_mins(1))
            .unwrap();

        let after = compose(&token, at_mins(2), &sub, &registry.current(), &TierLadder::default());
        assert_eq!(after.total, 25.0);
        assert_eq!(after.weights.version, 2);
    }

    #[test]
    fn test_concurrent_readers_see_whole_vectors() {
        let registry = Arc::new(WeightRegistry::default());
        let a = ScoringWeights::default();
        let b = ScoringWeights::from_array([0.10, 0.10, 0.10, 0.20, 0.15, 0.10, 0.25], 0);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let current = registry.current();
                        assert!(current.validate().is_ok());
                    }
                })
            })
            .collect();

        for i in 0..200 {
            let next = if i % 2 == 0 { b.clone() } else { a.clone() };
            registry.replace(next, make_justification(), at_mins(i)).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.current().version, 201);
        assert_eq!(registry.audit_log().len(), 200);
    }

    #[test]
    fn test_tg_signal_above_bound_rejected() {
        // Test: tg_signal = 0.40 (narrative lowered so the sum stays 1.0)
        let registry = WeightRegistry::default();
        let proposal = ScoringWeights::default()
            .with(ScoreComponent::TgSignal, 0.40)
            .with(ScoreComponent::Narrative, 0.05)
            .with(ScoreComponent::Profile, 0.05);

        let err = registry
            .replace(proposal, make_justification(), at_mins(0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidWeightVector(_)));
        assert_eq!(*registry.current(), ScoringWeights::default());
        assert!(registry.audit_log().is_empty());
    }

    /// Constant market: 1.0 at the mention, 2.5 from the sixth hour on
    struct SteadyMarket;

    #[async_trait]
    impl MarketDataProvider for SteadyMarket {
        async fn get_price(
            &self,
            _token: &TokenIdentity,
            at: DateTime<Utc>,
        ) -> Result<Option<f64>, MarketDataError> {
            Ok(Some(if at >= at_mins(360) { 2.5 } else { 1.0 }))
        }

        async fn get_snapshot(
            &self,
            _token: &TokenIdentity,
            at: DateTime<Utc>,
        ) -> Result<Option<MarketSnapshot>, MarketDataError> {
            Ok(Some(MarketSnapshot {
                price: if at >= at_mins(360) { 2.5 } else { 1.0 },
                mcap: Some(250_000.0),
                holders: Some(800),
                volume_24h: Some(90_000.0),
                liquidity_usd: Some(60_000.0),
                platform: Some("virtuals".to_string()),
            }))
        }

        fn provider_name(&self) -> &'static str {
            "steady"
        }
    }

    #[tokio::test]
    async fn test_full_flow_ingest_resolve_score() {
        let (_temp, store) = create_test_db();
        let market: Arc<dyn MarketDataProvider> = Arc::new(SteadyMarket);
        let detector = Arc::new(ConvergenceDetector::new(
            Duration::hours(2),
            QualityWeightParams::default(),
        ));

        let engine = Arc::new(
            PipelineEngine::new_with_timestamp_fn(
                detector.clone(),
                Arc::new(WeightRegistry::default()),
                Arc::new(MarketInputs::new(market.clone())),
                Arc::new(LogAlertSink),
                TierLadder::default(),
                Tier::Tier3,
                Box::new(|| at_mins(100)),
            )
            .with_store(store.clone()),
        );

        // 1. Ingest two converging calls
        let (tx, rx) = mpsc::channel(16);
        let ingestion = tokio::spawn(start_pipeline_ingestion(rx, engine.clone(), 60_000, 16));
        tx.send(make_call("alpha", "0xfeed", 0)).await.unwrap();
        tx.send(make_call("beta", "0xfeed", 45)).await.unwrap();
        drop(tx);
        ingestion.await.unwrap();

        let composites = store.recent_composites(10).await.unwrap();
        assert_eq!(composites.len(), 2);
        // Newest first: the converged score carries the convergence input
        assert_eq!(composites[0].sub_scores.tg_signal, 100.0);
        assert_eq!(composites[1].sub_scores.tg_signal, 0.0);
        assert_eq!(store.load_convergence_records().await.unwrap().len(), 1);

        // 2. Resolve once every offset has passed
        let resolver = Arc::new(OutcomeResolver::new(market, ResolverConfig::default()));
        let pool = Arc::new(ResolverPool::new_with_timestamp_fn(
            resolver,
            store.clone(),
            2,
            Box::new(|| at_mins(100 * 60)),
        ));
        let summary = pool.run_pass().await.unwrap();
        assert_eq!(summary.advanced, 2);

        let outcomes = store.latest_outcomes().await.unwrap();
        assert!(outcomes.iter().all(|o| o.state == ResolutionState::Resolved));
        assert!(outcomes.iter().all(|o| o.roi_if_sold_at_peak == Some(1.5)));

        // 3. Grade channels; alpha moved first in the only episode
        let graded = run_channel_scoring(
            store.as_ref(),
            &detector,
            &ChannelQualityScorer::new(5),
            at_mins(100 * 60),
        )
        .await
        .unwrap();
        assert_eq!(graded, 2);

        let scores = store.load_channel_scores().await.unwrap();
        let alpha = scores.iter().find(|s| s.source_id == "alpha").unwrap();
        let beta = scores.iter().find(|s| s.source_id == "beta").unwrap();
        assert_eq!(alpha.hit_rate_2x(), Some(1.0));
        assert!(alpha.first_mover_score > beta.first_mover_score);
    }
}

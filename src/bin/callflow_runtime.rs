//! Callflow Runtime - live call ingestion and scoring
//!
//! This binary wires the pipeline together:
//! - Initializes SQLite database with schema
//! - Restores the active weights and channel scores
//! - Reads call events as JSON lines from stdin
//! - Spawns background tasks (ingestion, resolver pool, channel scoring, recalibration)
//!
//! Usage:
//!   producer | cargo run --release --bin callflow_runtime
//!
//! Environment variables: see `PipelineConfig::from_env`. `ENABLE_PIPELINE`
//! must be `true` for the runtime to start.

use callflow::pipeline::{
    alerts::{AlertSink, JsonlAlertSink, LogAlertSink},
    channel_scorer::{ChannelQualityScorer, QualityWeightParams},
    config::PipelineConfig,
    convergence::ConvergenceDetector,
    db::{SignalStore, SqliteSignalStore},
    dexscreener::DexScreenerProvider,
    engine::PipelineEngine,
    ingestion::start_pipeline_ingestion,
    inputs::MarketInputs,
    market_data::MarketDataProvider,
    resolver::OutcomeResolver,
    scheduler::{channel_scoring_task, recalibration_task, resolver_scheduler_task, ResolverPool},
    types::CallEvent,
    weights::{ScoringWeights, WeightRegistry},
};
use dotenv::dotenv;
use env_logger::Env;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Forward JSON-lines call events from stdin into the ingestion channel
async fn read_stdin_events(tx: mpsc::Sender<CallEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CallEvent>(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            warn!("⚠️  Ingestion channel closed, stdin reader stopping");
                            return;
                        }
                    }
                    Err(e) => warn!("⚠️  Skipping malformed call event on line {}: {}", line_no, e),
                }
            }
            Ok(None) => {
                info!("📝 stdin closed after {} lines", line_no);
                return;
            }
            Err(e) => {
                error!("❌ Failed to read stdin: {}", e);
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("🚀 Callflow Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env();

    if !config.enabled {
        info!("⚠️  Pipeline is DISABLED (set ENABLE_PIPELINE=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }
    config.validate()?;
    let ladder = config.tier_ladder()?;
    let alert_min_tier = config.alert_min_tier()?;

    info!("✅ Pipeline ENABLED");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Channel buffer: {} calls", config.channel_buffer);
    info!("   ├─ Convergence window: {}s", config.convergence_window_secs);
    info!(
        "   ├─ Tiers: {:.0} / {:.0} / {:.0} (alert at {})",
        ladder.tier1,
        ladder.tier2,
        ladder.tier3,
        alert_min_tier.as_str()
    );
    info!(
        "   └─ Resolver: {} workers, {}ms between requests",
        config.resolver_max_concurrency,
        config.resolver_request_spacing_ms
    );

    // Initialize database
    info!("🔧 Initializing database...");
    let store: Arc<dyn SignalStore> = Arc::new(SqliteSignalStore::open_with_migrations(
        &config.db_path,
        &config.schema_dir,
    )?);
    info!("✅ Database initialized");

    // Restore state from the last run
    let weights = store.load_weights().await?.unwrap_or_default();
    let registry = Arc::new(WeightRegistry::new(weights));
    if registry.current().same_values(&ScoringWeights::default()) {
        info!("📊 Using default weights v{}", registry.current().version);
    } else {
        info!("📊 Restored weights {}", registry.current());
    }

    let detector = Arc::new(ConvergenceDetector::new(
        config.convergence_window(),
        QualityWeightParams::default(),
    ));
    let scores = store.load_channel_scores().await?;
    info!("📊 Restored {} channel scores", scores.len());
    detector.replace_channel_scores(scores);

    // Collaborators
    let market: Arc<dyn MarketDataProvider> = Arc::new(DexScreenerProvider::new()?);
    let alerts: Arc<dyn AlertSink> = match &config.alerts_jsonl_path {
        Some(path) => Arc::new(JsonlAlertSink::new(path)?),
        None => Arc::new(LogAlertSink),
    };
    info!("✅ Alert sink: {}", alerts.sink_type());

    let engine = Arc::new(
        PipelineEngine::new(
            detector.clone(),
            registry.clone(),
            Arc::new(MarketInputs::new(market.clone())),
            alerts,
            ladder,
            alert_min_tier,
        )
        .with_store(store.clone()),
    );
    info!("✅ PipelineEngine created");

    let resolver = Arc::new(
        OutcomeResolver::new(market, config.resolver_config())
            .with_request_spacing(config.resolver_request_spacing_ms),
    );
    let pool = Arc::new(ResolverPool::new(
        resolver,
        store.clone(),
        config.resolver_max_concurrency,
    ));

    let (tx, rx) = mpsc::channel::<CallEvent>(config.channel_buffer);
    info!("✅ Call channel created (buffer: {})", config.channel_buffer);

    // Spawn background tasks
    info!("🚀 Spawning background tasks...");

    tokio::spawn(start_pipeline_ingestion(
        rx,
        engine.clone(),
        config.convergence_gc_interval_ms,
        config.channel_buffer,
    ));
    info!("   ├─ ✅ Ingestion task spawned");

    tokio::spawn(read_stdin_events(tx.clone()));
    info!("   ├─ ✅ stdin reader spawned");

    tokio::spawn(resolver_scheduler_task(pool, config.resolver_retry_interval_ms));
    info!("   ├─ ✅ Resolver scheduler spawned");

    tokio::spawn(channel_scoring_task(
        store.clone(),
        detector,
        ChannelQualityScorer::new(config.min_bucket_samples),
        config.channel_scoring_interval_ms,
    ));
    info!("   ├─ ✅ Channel scoring spawned");

    tokio::spawn(recalibration_task(
        store,
        registry,
        config.recalibration_config(),
        config.convergence_window(),
        config.recalibration_interval_secs,
    ));
    info!("   └─ ✅ Recalibration cycle spawned");

    info!("🔄 Press CTRL+C to shutdown gracefully");

    // Wait for CTRL+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    // Cleanup: Drop tx to close channel once the stdin reader is gone
    drop(tx);

    // Give tasks time to finish
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
    engine.flush_alerts().await;

    info!("✅ Callflow runtime stopped");
    Ok(())
}

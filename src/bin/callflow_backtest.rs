//! Callflow Backtest - replay stored history under candidate weights
//!
//! Rebuilds history from `call_outcomes` and `platform_tokens`, backtests the
//! active and default weight vectors over the recalibration period and prints
//! the performance report as JSON on stdout.
//!
//! Usage:
//!   cargo run --release --bin callflow_backtest [--all] [--recalibrate]
//!
//! Flags:
//!   --all          Use the whole history instead of the recalibration period
//!   --recalibrate  Run one recalibration and persist the winner if it changed

use callflow::pipeline::{
    backtest::{backtest, reconstruct_history, samples_in_period},
    config::PipelineConfig,
    db::{SignalStore, SqliteSignalStore},
    recalibrate::recalibrate,
    scheduler::install_recalibration,
    weights::{ScoringWeights, WeightRegistry},
};
use chrono::Utc;
use dotenv::dotenv;
use env_logger::Env;
use log::{info, warn};
use std::env;

#[derive(Debug)]
struct BacktestArgs {
    all_history: bool,
    recalibrate: bool,
}

impl BacktestArgs {
    fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let mut parsed = Self {
            all_history: false,
            recalibrate: false,
        };
        for arg in env::args().skip(1) {
            match arg.as_str() {
                "--all" => parsed.all_history = true,
                "--recalibrate" => parsed.recalibrate = true,
                other => {
                    return Err(format!(
                        "Unknown argument {}. Usage: callflow_backtest [--all] [--recalibrate]",
                        other
                    )
                    .into())
                }
            }
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = BacktestArgs::from_args()?;
    let config = PipelineConfig::from_env();
    config.validate()?;
    let ladder = config.tier_ladder()?;
    let recal_config = config.recalibration_config();

    info!("🚀 Callflow Backtest");
    info!("   ├─ Database: {}", config.db_path);
    if args.all_history {
        info!("   └─ Period: all history");
    } else {
        info!("   └─ Period: last {} days", config.recalibration_period_days);
    }

    let store = SqliteSignalStore::open_with_migrations(&config.db_path, &config.schema_dir)?;
    let outcomes = store.latest_outcomes().await?;
    let platform_tokens = store.load_platform_tokens().await?;
    let history = reconstruct_history(&outcomes, &platform_tokens, config.convergence_window());
    info!(
        "📊 History: {} samples from {} outcomes and {} platform tokens",
        history.len(),
        outcomes.len(),
        platform_tokens.len()
    );

    let now = Utc::now();
    let period = if args.all_history {
        history.clone()
    } else {
        samples_in_period(&history, now - recal_config.period, now)
    };

    let active = store.load_weights().await?.unwrap_or_default();
    let mut candidates = vec![active.clone()];
    if !active.same_values(&ScoringWeights::default()) {
        candidates.push(ScoringWeights::default());
    }

    let report = backtest(&period, &candidates, &ladder);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !args.recalibrate {
        return Ok(());
    }

    let registry = WeightRegistry::new(active);
    let result = match recalibrate(&history, &registry.current(), now, &recal_config) {
        Ok(result) => result,
        Err(e) if e.is_skippable() => {
            warn!("⚠️  Recalibration declined: {}", e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("{}", serde_json::to_string_pretty(&result)?);

    match install_recalibration(&store, &registry, &result, now).await? {
        Some(record) => {
            store.save_weights(&record).await?;
            info!("✅ Weights v{} persisted", record.after.version);
        }
        None => info!("📊 Active weights kept"),
    }
    Ok(())
}

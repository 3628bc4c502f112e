//! Pipeline ingestion - async channel processor for call events
//!
//! Events are processed one at a time in arrival order, so the convergence
//! windows see calls in the order the collaborator delivered them.

use super::engine::PipelineEngine;
use super::types::{CallEvent, TokenIdentity};
use chrono::Timelike;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Canonical form of an incoming event
///
/// Re-normalizes the token identity, trims the source id and truncates the
/// timestamp to whole seconds (the store keeps unix seconds). Events without a
/// source or address are rejected.
pub fn normalize_event(mut event: CallEvent) -> Option<CallEvent> {
    let source_id = event.source_id.trim();
    if source_id.is_empty() || event.token.address.trim().is_empty() {
        return None;
    }
    event.source_id = source_id.to_string();
    event.token = TokenIdentity::new(&event.token.chain, &event.token.address);
    event.timestamp = event.timestamp.with_nanosecond(0).unwrap_or(event.timestamp);
    Some(event)
}

/// Persist convergence records accumulated by the detector
///
/// A failed write hands the records back to the detector for the next tick.
async fn flush_records(engine: &PipelineEngine) -> usize {
    let records = engine.detector().drain_records();
    if records.is_empty() {
        return 0;
    }
    let count = records.len();
    match engine.store() {
        Some(store) => {
            if let Err(e) = store.append_convergence_records(&records).await {
                log::error!("❌ Failed to write {} convergence records, retrying next tick: {}", count, e);
                engine.detector().requeue_records(records);
                return 0;
            }
        }
        None => log::debug!("⏭️  No store configured, {} convergence records dropped", count),
    }
    count
}

/// Start pipeline ingestion from the call event channel
///
/// Main loop:
/// 1. Receives call events via mpsc channel
/// 2. Processes each event through PipelineEngine
/// 3. Periodically reclaims idle convergence windows and persists convergence records
///
/// Arguments:
/// - `rx`: Receiver end of call event channel
/// - `engine`: Shared PipelineEngine instance
/// - `gc_interval_ms`: How often idle windows are collected (milliseconds)
/// - `channel_capacity`: Buffer size of `rx`, for utilization logging
///
/// This function runs until the channel is closed.
pub async fn start_pipeline_ingestion(
    mut rx: mpsc::Receiver<CallEvent>,
    engine: Arc<PipelineEngine>,
    gc_interval_ms: u64,
    channel_capacity: usize,
) {
    log::info!("🚀 Starting call ingestion");
    log::info!("   ├─ GC interval: {}ms", gc_interval_ms);
    log::info!("   └─ Waiting for calls...");

    let mut gc_timer = interval(Duration::from_millis(gc_interval_ms));
    let mut event_count = 0u64;
    let mut last_log_time = std::time::Instant::now();

    loop {
        tokio::select! {
            received = rx.recv() => {
                // Channel closed
                let Some(event) = received else {
                    log::warn!("⚠️  Call channel closed, stopping ingestion");
                    log::info!("🔄 Performing final flush...");
                    let written = flush_records(&engine).await;
                    engine.flush_alerts().await;
                    log::info!("✅ Final flush complete ({} convergence records)", written);
                    break;
                };

                let Some(event) = normalize_event(event) else {
                    log::warn!("⚠️  Dropping call event without source or address");
                    continue;
                };

                if let Err(e) = engine.process_event(&event).await {
                    log::error!("❌ Failed to process call {}: {}", event.key(), e);
                }

                event_count += 1;

                // Log throughput every 10 seconds
                if last_log_time.elapsed().as_secs() >= 10 {
                    let per_sec = event_count as f64 / last_log_time.elapsed().as_secs_f64();
                    log::info!("📊 Ingestion rate: {:.1} calls/sec (total: {})", per_sec, event_count);
                    last_log_time = std::time::Instant::now();
                    event_count = 0;
                }
            }

            _ = gc_timer.tick() => {
                let reclaimed = engine.detector().collect_idle(engine.now());
                let written = flush_records(&engine).await;
                engine.flush_alerts().await;

                let channel_usage = rx.len();
                log::debug!(
                    "📊 GC: {} windows reclaimed, {} active | {} records | channel: {}/{}",
                    reclaimed,
                    engine.detector().active_tokens(),
                    written,
                    channel_usage,
                    channel_capacity
                );

                if channel_capacity > 0 && channel_usage > channel_capacity / 2 {
                    log::warn!(
                        "⚠️  Channel usage high: {}/{} ({}%)",
                        channel_usage,
                        channel_capacity,
                        (channel_usage * 100) / channel_capacity
                    );
                }
            }
        }
    }

    log::info!("✅ Call ingestion stopped");
}

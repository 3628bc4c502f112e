//! Alert sinks - where tiered composite scores go
//!
//! `LogAlertSink` writes one line per alert through `log`. `JsonlAlertSink`
//! appends one JSON object per line to a file, flushing every 5 seconds and on
//! drop.

use super::composite::{CompositeScore, Tier};
use super::error::PipelineError;
use super::types::ConvergenceSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A composite score that cleared the alert tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub composite: CompositeScore,
    pub tier: Tier,
    pub convergence: Option<ConvergenceSignal>,
}

impl Alert {
    pub fn new(composite: CompositeScore, convergence: Option<ConvergenceSignal>) -> Self {
        let tier = composite.tier;
        Self {
            composite,
            tier,
            convergence,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), PipelineError>;

    async fn flush(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn sink_type(&self) -> &'static str;
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), PipelineError> {
        let sources = alert
            .convergence
            .as_ref()
            .map(|c| c.contributing_sources.join(", "))
            .unwrap_or_else(|| "-".to_string());
        log::info!(
            "🚨 {} {} | total {:.1} | weights v{} | sources: {}",
            alert.tier.as_str(),
            alert.composite.token,
            alert.composite.total,
            alert.composite.weights.version,
            sources
        );
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "LOG"
    }
}

struct JsonlState {
    writer: BufWriter<std::fs::File>,
    last_flush: Instant,
}

pub struct JsonlAlertSink {
    state: Mutex<JsonlState>,
}

impl JsonlAlertSink {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        log::info!("📝 Writing alerts to: {}", path.display());
        Ok(Self {
            state: Mutex::new(JsonlState {
                writer: BufWriter::new(file),
                last_flush: Instant::now(),
            }),
        })
    }

    fn write_line(&self, alert: &Alert) -> Result<(), PipelineError> {
        let json = serde_json::to_string(alert)?;
        let mut state = self.state.lock().map_err(|_| PipelineError::LockPoisoned)?;
        writeln!(state.writer, "{}", json)?;

        if state.last_flush.elapsed() > Duration::from_secs(5) {
            state.writer.flush()?;
            state.last_flush = Instant::now();
        }
        Ok(())
    }

    fn flush_now(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().map_err(|_| PipelineError::LockPoisoned)?;
        state.writer.flush()?;
        state.last_flush = Instant::now();
        Ok(())
    }
}

impl Drop for JsonlAlertSink {
    fn drop(&mut self) {
        if let Err(e) = self.flush_now() {
            log::error!("❌ Failed to flush JSONL alerts on shutdown: {}", e);
        }
    }
}

#[async_trait]
impl AlertSink for JsonlAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), PipelineError> {
        self.write_line(alert)
    }

    async fn flush(&self) -> Result<(), PipelineError> {
        self.flush_now()
    }

    fn sink_type(&self) -> &'static str {
        "JSONL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::composite::{compose, SubScores, TierLadder};
    use crate::pipeline::types::TokenIdentity;
    use crate::pipeline::weights::ScoringWeights;
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;

    fn make_alert() -> Alert {
        let token = TokenIdentity::new("base", "0xbeef");
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let inputs = SubScores {
            narrative: 90.0,
            profile: 90.0,
            platform: 90.0,
            market: 90.0,
            depth: 90.0,
            wallet: 90.0,
            tg_signal: 90.0,
        };
        let composite = compose(
            &token,
            at,
            &inputs,
            &ScoringWeights::default(),
            &TierLadder::default(),
        );
        let convergence = ConvergenceSignal {
            token,
            contributing_sources: vec!["alpha".to_string(), "beta".to_string()],
            confidence: 0.9,
            generated_at: at,
        };
        Alert::new(composite, Some(convergence))
    }

    #[test]
    fn test_alert_takes_composite_tier() {
        let alert = make_alert();
        assert_eq!(alert.tier, Tier::Tier1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_flushes_on_drop() {
        let temp = NamedTempFile::new().unwrap();
        let sink = JsonlAlertSink::new(temp.path()).unwrap();
        sink.send(&make_alert()).await.unwrap();
        drop(sink);

        let content = std::fs::read_to_string(temp.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let temp = NamedTempFile::new().unwrap();
        let sink = JsonlAlertSink::new(temp.path()).unwrap();

        sink.send(&make_alert()).await.unwrap();
        sink.send(&make_alert()).await.unwrap();
        sink.flush().await.unwrap();

        let content = std::fs::read_to_string(temp.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Alert = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.composite.total, 90.0);
        assert_eq!(
            parsed.convergence.unwrap().contributing_sources,
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        assert!(LogAlertSink.send(&make_alert()).await.is_ok());
        assert_eq!(LogAlertSink.sink_type(), "LOG");
    }
}

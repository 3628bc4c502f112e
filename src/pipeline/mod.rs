//! # Call-Signal Pipeline
//!
//! Grades signal sources against realized outcomes, detects when independent
//! sources converge on one token, combines every input into a bounded
//! composite score and keeps the scoring weights calibrated.
//!
//! ## Data Flow
//!
//! ```text
//! CallEvent (stdin / mpsc)
//!     ├──► ResolverPool ──► OutcomeResolver ──► call_outcomes (append-only)
//!     │                                               │
//!     │                        channel scoring pass ◄─┘
//!     │                               │
//!     │                               ▼
//!     │                        channel_scores (full replace)
//!     │                               │
//!     └──► ConvergenceDetector ◄──────┘ (score book swap)
//!               │
//!               ▼
//!         CompositeScorer ◄── ScoringInputsProvider + WeightRegistry
//!               │
//!               ▼
//!         composite_scores + AlertSink
//! ```
//!
//! Backtest and recalibration run out of band over the stored history and
//! publish new weights through [`weights::WeightRegistry`].
//!
//! ## Schema Reference
//!
//! All tables are created by the idempotent scripts in `/sql/`:
//! - `call_outcomes` → `CallOutcome` (versioned, append-only)
//! - `channel_scores` → `ChannelScore`
//! - `convergence_records` → `ConvergenceRecord`
//! - `composite_scores` → `CompositeScore`
//! - `scoring_weights` / `weight_audit` → `ScoringWeights` / `WeightAuditRecord`
//! - `platform_tokens` → `PlatformToken`
//!
//! ## Module Organization
//!
//! - `types` - Core entities (CallEvent, CallOutcome, ChannelScore, ...)
//! - `error` - Pipeline error taxonomy
//! - `resolver` - Outcome resolution state machine
//! - `channel_scorer` - Per-source quality grading
//! - `convergence` - Sliding-window multi-source detection
//! - `composite` / `weights` / `normalize` - Bounded scoring
//! - `backtest` / `recalibrate` - Replay and weight search
//! - `market_data` / `dexscreener` / `backoff` / `inputs` / `alerts` - Collaborator contracts
//! - `db` - SQLite store
//! - `engine` / `ingestion` / `scheduler` - Runtime orchestration

pub mod types;
pub mod error;
pub mod config;
pub mod market_data;
pub mod dexscreener;
pub mod backoff;
pub mod resolver;
pub mod channel_scorer;
pub mod convergence;
pub mod normalize;
pub mod weights;
pub mod composite;
pub mod inputs;
pub mod backtest;
pub mod recalibrate;
pub mod alerts;
pub mod db;
pub mod engine;
pub mod ingestion;
pub mod scheduler;

// Re-export commonly used types
pub use types::{
    CallEvent, CallKey, CallOutcome, ChannelScore, ConvergenceRecord, ConvergenceSignal,
    MarketSnapshot, PlatformToken, ResolutionState, TokenIdentity,
};
pub use error::PipelineError;
pub use config::PipelineConfig;
pub use market_data::{MarketDataError, MarketDataProvider};
pub use resolver::OutcomeResolver;
pub use channel_scorer::ChannelQualityScorer;
pub use convergence::{ConvergenceDetector, FirstMoverLedger};
pub use weights::{ScoringWeights, WeightRegistry};
pub use composite::{compose, CompositeScore, SubScores, Tier, TierLadder};
pub use alerts::{Alert, AlertSink, JsonlAlertSink, LogAlertSink};
pub use db::{SignalStore, SqliteSignalStore};
pub use engine::{EngineOutput, PipelineEngine};
pub use scheduler::ResolverPool;

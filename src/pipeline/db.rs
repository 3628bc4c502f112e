//! SQLite signal store
//!
//! Tables (see `/sql/` directory):
//! - `call_outcomes` - INSERT only, one row per (call, version)
//! - `channel_scores` - full replace per scoring pass
//! - `convergence_records` - INSERT only
//! - `composite_scores` - INSERT only
//! - `scoring_weights` - single active row, replaced with an audit row
//! - `weight_audit` - INSERT only
//! - `platform_tokens` - UPSERT on (chain, address)
//!
//! Timestamps are stored as unix seconds.

use super::composite::{CompositeScore, SubScores, Tier};
use super::error::{PipelineError, PipelineResult};
use super::types::{
    CallKey, CallOutcome, ChannelScore, ConvergenceRecord, McapBucket, PlatformToken,
    ResolutionState, TokenIdentity,
};
use super::weights::{ScoringWeights, WeightAuditRecord, WeightJustification};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Persistence contract for every pipeline entity
///
/// Append-only entities are never updated in place; readers of
/// `call_outcomes` see the highest version per call.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Append one outcome version. Re-appending an existing version is a no-op.
    async fn append_outcome(&self, outcome: &CallOutcome) -> PipelineResult<()>;

    /// Latest version of every call, in one read
    async fn latest_outcomes(&self) -> PipelineResult<Vec<CallOutcome>>;

    async fn latest_outcome(&self, key: &CallKey) -> PipelineResult<Option<CallOutcome>>;

    /// Replace the whole `channel_scores` table in one transaction
    async fn replace_channel_scores(&self, scores: &[ChannelScore]) -> PipelineResult<()>;

    async fn load_channel_scores(&self) -> PipelineResult<Vec<ChannelScore>>;

    async fn append_convergence_records(&self, records: &[ConvergenceRecord]) -> PipelineResult<()>;

    async fn load_convergence_records(&self) -> PipelineResult<Vec<ConvergenceRecord>>;

    async fn append_composite(&self, score: &CompositeScore) -> PipelineResult<()>;

    /// Most recent composite snapshots, newest first
    async fn recent_composites(&self, limit: usize) -> PipelineResult<Vec<CompositeScore>>;

    /// Active weight vector, `None` before the first replacement
    async fn load_weights(&self) -> PipelineResult<Option<ScoringWeights>>;

    /// Store `record.after` as the active vector and append the audit row atomically
    async fn save_weights(&self, record: &WeightAuditRecord) -> PipelineResult<()>;

    async fn load_weight_audit(&self) -> PipelineResult<Vec<WeightAuditRecord>>;

    async fn upsert_platform_token(&self, token: &PlatformToken) -> PipelineResult<()>;

    async fn load_platform_tokens(&self) -> PipelineResult<Vec<PlatformToken>>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in name order (00_, 01_, ...) and
/// executes them. Every file uses `IF NOT EXISTS`, so running twice is safe.
///
/// Arguments:
/// - `conn`: SQLite connection
/// - `schema_dir`: Path to directory containing .sql files
///
/// Returns: Ok(()) if all migrations succeed, Err(...) on first failure
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> PipelineResult<()> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(PipelineError::SchemaNotFound(schema_dir.to_string()));
    }

    // PRAGMA journal_mode returns a row, so pragma_update rather than execute
    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|secs| from_ts(secs, idx))
        .transpose()
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_ts(row.get(idx)?, idx)
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unrecognized value: {}", value).into(),
    )
}

const OUTCOME_COLUMNS: &str = "o.source_id, o.chain, o.address, o.mention_timestamp, o.version, \
     o.state, o.price_at_mention, o.price_1h, o.price_6h, o.price_24h, o.price_peak, \
     o.peak_timestamp, o.mcap_at_mention, o.holders_at_mention, o.platform, \
     o.narrative_tags, o.roi_if_sold_at_peak, o.resolved_at";

fn outcome_from_row(row: &Row<'_>) -> rusqlite::Result<CallOutcome> {
    let state_text: String = row.get(5)?;
    let state = ResolutionState::from_str(&state_text).ok_or_else(|| bad_text(5, &state_text))?;
    let tags: BTreeSet<String> = json_col(row, 15)?;

    Ok(CallOutcome {
        source_id: row.get(0)?,
        token: TokenIdentity {
            chain: row.get(1)?,
            address: row.get(2)?,
        },
        mention_timestamp: ts(row, 3)?,
        version: row.get(4)?,
        state,
        price_at_mention: row.get(6)?,
        price_1h: row.get(7)?,
        price_6h: row.get(8)?,
        price_24h: row.get(9)?,
        price_peak: row.get(10)?,
        peak_timestamp: opt_ts(row, 11)?,
        mcap_at_mention: row.get(12)?,
        holders_at_mention: row.get::<_, Option<i64>>(13)?.map(|h| h.max(0) as u64),
        platform: row.get(14)?,
        narrative_tags: tags,
        roi_if_sold_at_peak: row.get(16)?,
        resolved_at: ts(row, 17)?,
    })
}

fn channel_score_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelScore> {
    let bucket: Option<String> = row.get(9)?;
    let best_mcap_range = match bucket {
        Some(label) => Some(McapBucket::from_str(&label).ok_or_else(|| bad_text(9, &label))?),
        None => None,
    };

    Ok(ChannelScore {
        source_id: row.get(0)?,
        total_calls: row.get(1)?,
        pending_calls: row.get(2)?,
        hit_rate_2x: row.get(3)?,
        hit_rate_5x: row.get(4)?,
        avg_roi: row.get(5)?,
        median_roi: row.get(6)?,
        median_time_to_peak_secs: row.get(7)?,
        best_platform: row.get(8)?,
        best_mcap_range,
        first_mover_score: row.get(10)?,
        quality_score: row.get(11)?,
        last_updated: ts(row, 12)?,
    })
}

fn composite_from_row(row: &Row<'_>) -> rusqlite::Result<CompositeScore> {
    let tier_text: String = row.get(13)?;
    let tier = Tier::parse(&tier_text).ok_or_else(|| bad_text(13, &tier_text))?;
    let mut weights: ScoringWeights = json_col(row, 11)?;
    weights.version = row.get::<_, i64>(12)? as u64;

    Ok(CompositeScore {
        token: TokenIdentity {
            chain: row.get(0)?,
            address: row.get(1)?,
        },
        scored_at: ts(row, 2)?,
        sub_scores: SubScores {
            narrative: row.get(3)?,
            profile: row.get(4)?,
            platform: row.get(5)?,
            market: row.get(6)?,
            depth: row.get(7)?,
            wallet: row.get(8)?,
            tg_signal: row.get(9)?,
        },
        weights,
        total: row.get(10)?,
        tier,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<WeightAuditRecord> {
    Ok(WeightAuditRecord {
        before: json_col(row, 0)?,
        after: json_col(row, 1)?,
        justification: WeightJustification {
            statistic: row.get(2)?,
            previous_statistic: row.get(3)?,
            period_start: ts(row, 4)?,
            period_end: ts(row, 5)?,
            reason: row.get(6)?,
        },
        recorded_at: ts(row, 7)?,
    })
}

fn platform_token_from_row(row: &Row<'_>) -> rusqlite::Result<PlatformToken> {
    Ok(PlatformToken {
        token: TokenIdentity {
            chain: row.get(0)?,
            address: row.get(1)?,
        },
        platform: row.get(2)?,
        deploy_timestamp: ts(row, 3)?,
        mcap_1h: row.get(4)?,
        peak_mcap: row.get(5)?,
        peak_timestamp: opt_ts(row, 6)?,
        volume_24h_at_peak: row.get(7)?,
        liquidity_usd: row.get(8)?,
        holders_24h: row.get::<_, Option<i64>>(9)?.map(|h| h.max(0) as u64),
        narrative_tags: json_col(row, 10)?,
        complete: row.get(11)?,
    })
}

/// What appending one outcome version did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutcomeWrite {
    Inserted,
    /// Same version already stored with the same observations
    Duplicate,
    /// Same version already stored with different observations; the stored row wins
    Conflict,
}

fn insert_outcome(conn: &Connection, outcome: &CallOutcome) -> PipelineResult<OutcomeWrite> {
    let tags = serde_json::to_string(&outcome.narrative_tags)?;
    let changed = conn.execute(
        r#"
        INSERT OR IGNORE INTO call_outcomes (
            source_id, chain, address, mention_timestamp, version, state,
            price_at_mention, price_1h, price_6h, price_24h, price_peak, peak_timestamp,
            mcap_at_mention, holders_at_mention, platform, narrative_tags,
            roi_if_sold_at_peak, resolved_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            outcome.source_id,
            outcome.token.chain,
            outcome.token.address,
            to_ts(outcome.mention_timestamp),
            outcome.version,
            outcome.state.as_str(),
            outcome.price_at_mention,
            outcome.price_1h,
            outcome.price_6h,
            outcome.price_24h,
            outcome.price_peak,
            outcome.peak_timestamp.map(to_ts),
            outcome.mcap_at_mention,
            outcome.holders_at_mention.map(|h| h as i64),
            outcome.platform,
            tags,
            outcome.roi_if_sold_at_peak,
            to_ts(outcome.resolved_at),
        ],
    )?;
    if changed > 0 {
        return Ok(OutcomeWrite::Inserted);
    }

    let sql = format!(
        r#"
        SELECT {}
        FROM call_outcomes o
        WHERE o.source_id = ? AND o.chain = ? AND o.address = ? AND o.mention_timestamp = ?
          AND o.version = ?
        "#,
        OUTCOME_COLUMNS
    );
    let stored = conn
        .query_row(
            &sql,
            params![
                outcome.source_id,
                outcome.token.chain,
                outcome.token.address,
                to_ts(outcome.mention_timestamp),
                outcome.version,
            ],
            outcome_from_row,
        )
        .optional()?;

    match stored {
        Some(stored) if same_stored_observations(&stored, outcome) => Ok(OutcomeWrite::Duplicate),
        _ => Ok(OutcomeWrite::Conflict),
    }
}

/// Compared at the store's one-second resolution; `resolved_at` is bookkeeping
fn same_stored_observations(stored: &CallOutcome, incoming: &CallOutcome) -> bool {
    stored.state == incoming.state
        && stored.price_at_mention == incoming.price_at_mention
        && stored.price_1h == incoming.price_1h
        && stored.price_6h == incoming.price_6h
        && stored.price_24h == incoming.price_24h
        && stored.price_peak == incoming.price_peak
        && stored.peak_timestamp.map(to_ts) == incoming.peak_timestamp.map(to_ts)
        && stored.mcap_at_mention == incoming.mcap_at_mention
        && stored.holders_at_mention == incoming.holders_at_mention
        && stored.platform == incoming.platform
        && stored.narrative_tags == incoming.narrative_tags
        && stored.roi_if_sold_at_peak == incoming.roi_if_sold_at_peak
}

/// SQLite implementation of `SignalStore`
///
/// One connection behind a mutex; the lock is never held across an await.
pub struct SqliteSignalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSignalStore {
    /// Open an existing database (schema must already be applied)
    pub fn new(db_path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) the database and apply the `.sql` migrations
    pub fn open_with_migrations(db_path: &str, schema_dir: &str) -> PipelineResult<Self> {
        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> PipelineResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PipelineError::LockPoisoned)
    }
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn append_outcome(&self, outcome: &CallOutcome) -> PipelineResult<()> {
        let conn = self.lock()?;
        if insert_outcome(&conn, outcome)? == OutcomeWrite::Conflict {
            log::warn!(
                "⚠️  Outcome {} v{} already stored with different data, write ignored",
                outcome.key(),
                outcome.version
            );
        }
        Ok(())
    }

    async fn latest_outcomes(&self) -> PipelineResult<Vec<CallOutcome>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {}
            FROM call_outcomes o
            JOIN (
                SELECT source_id, chain, address, mention_timestamp, MAX(version) AS version
                FROM call_outcomes
                GROUP BY source_id, chain, address, mention_timestamp
            ) latest
              ON latest.source_id = o.source_id
             AND latest.chain = o.chain
             AND latest.address = o.address
             AND latest.mention_timestamp = o.mention_timestamp
             AND latest.version = o.version
            ORDER BY o.mention_timestamp, o.source_id, o.chain, o.address
            "#,
            OUTCOME_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], outcome_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn latest_outcome(&self, key: &CallKey) -> PipelineResult<Option<CallOutcome>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {}
            FROM call_outcomes o
            WHERE o.source_id = ? AND o.chain = ? AND o.address = ? AND o.mention_timestamp = ?
            ORDER BY o.version DESC
            LIMIT 1
            "#,
            OUTCOME_COLUMNS
        );
        let outcome = conn
            .query_row(
                &sql,
                params![
                    key.source_id,
                    key.token.chain,
                    key.token.address,
                    to_ts(key.mention_timestamp)
                ],
                outcome_from_row,
            )
            .optional()?;
        Ok(outcome)
    }

    async fn replace_channel_scores(&self, scores: &[ChannelScore]) -> PipelineResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM channel_scores", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO channel_scores (
                    source_id, total_calls, pending_calls, hit_rate_2x, hit_rate_5x,
                    avg_roi, median_roi, median_time_to_peak_secs, best_platform,
                    best_mcap_range, first_mover_score, quality_score, last_updated
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for score in scores {
                stmt.execute(params![
                    score.source_id,
                    score.total_calls,
                    score.pending_calls,
                    score.hit_rate_2x,
                    score.hit_rate_5x,
                    score.avg_roi,
                    score.median_roi,
                    score.median_time_to_peak_secs,
                    score.best_platform,
                    score.best_mcap_range.as_ref().map(|b| b.as_str()),
                    score.first_mover_score,
                    score.quality_score,
                    to_ts(score.last_updated),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn load_channel_scores(&self) -> PipelineResult<Vec<ChannelScore>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT source_id, total_calls, pending_calls, hit_rate_2x, hit_rate_5x,
                   avg_roi, median_roi, median_time_to_peak_secs, best_platform,
                   best_mcap_range, first_mover_score, quality_score, last_updated
            FROM channel_scores
            ORDER BY quality_score DESC, source_id
            "#,
        )?;
        let rows = stmt.query_map([], channel_score_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn append_convergence_records(&self, records: &[ConvergenceRecord]) -> PipelineResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO convergence_records (
                    chain, address, episode_start, contributors_json, recorded_at
                ) VALUES (?, ?, ?, ?, ?)
                "#,
            )?;
            for record in records {
                let contributors = serde_json::to_string(&record.contributors)?;
                stmt.execute(params![
                    record.token.chain,
                    record.token.address,
                    to_ts(record.episode_start),
                    contributors,
                    to_ts(record.recorded_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn load_convergence_records(&self) -> PipelineResult<Vec<ConvergenceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT chain, address, episode_start, contributors_json, recorded_at
            FROM convergence_records
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ConvergenceRecord {
                token: TokenIdentity {
                    chain: row.get(0)?,
                    address: row.get(1)?,
                },
                episode_start: ts(row, 2)?,
                contributors: json_col(row, 3)?,
                recorded_at: ts(row, 4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn append_composite(&self, score: &CompositeScore) -> PipelineResult<()> {
        let weights_json = serde_json::to_string(&score.weights)?;
        let conn = self.lock()?;
        let s = &score.sub_scores;

        conn.execute(
            r#"
            INSERT INTO composite_scores (
                chain, address, scored_at, narrative, profile, platform, market,
                depth, wallet, tg_signal, weights_json, weights_version, total, tier
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                score.token.chain,
                score.token.address,
                to_ts(score.scored_at),
                s.narrative,
                s.profile,
                s.platform,
                s.market,
                s.depth,
                s.wallet,
                s.tg_signal,
                weights_json,
                score.weights.version as i64,
                score.total,
                score.tier.as_str(),
            ],
        )?;
        Ok(())
    }

    async fn recent_composites(&self, limit: usize) -> PipelineResult<Vec<CompositeScore>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT chain, address, scored_at, narrative, profile, platform, market,
                   depth, wallet, tg_signal, total, weights_json, weights_version, tier
            FROM composite_scores
            ORDER BY id DESC
            LIMIT ?
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], composite_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn load_weights(&self) -> PipelineResult<Option<ScoringWeights>> {
        let conn = self.lock()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, weights_json FROM scoring_weights WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((version, json)) => {
                let mut weights: ScoringWeights = serde_json::from_str(&json)?;
                weights.version = version as u64;
                Ok(Some(weights))
            }
            None => Ok(None),
        }
    }

    async fn save_weights(&self, record: &WeightAuditRecord) -> PipelineResult<()> {
        let before_json = serde_json::to_string(&record.before)?;
        let after_json = serde_json::to_string(&record.after)?;
        let j = &record.justification;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO scoring_weights (id, version, weights_json, updated_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                weights_json = excluded.weights_json,
                updated_at = excluded.updated_at
            "#,
            params![
                record.after.version as i64,
                after_json,
                to_ts(record.recorded_at)
            ],
        )?;

        tx.execute(
            r#"
            INSERT INTO weight_audit (
                version_before, version_after, before_json, after_json, statistic,
                previous_statistic, period_start, period_end, justification, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.before.version as i64,
                record.after.version as i64,
                before_json,
                after_json,
                j.statistic,
                j.previous_statistic,
                to_ts(j.period_start),
                to_ts(j.period_end),
                j.reason,
                to_ts(record.recorded_at),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    async fn load_weight_audit(&self) -> PipelineResult<Vec<WeightAuditRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT before_json, after_json, statistic, previous_statistic,
                   period_start, period_end, justification, recorded_at
            FROM weight_audit
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], audit_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn upsert_platform_token(&self, token: &PlatformToken) -> PipelineResult<()> {
        let tags = serde_json::to_string(&token.narrative_tags)?;
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO platform_tokens (
                chain, address, platform, deploy_timestamp, mcap_1h, peak_mcap,
                peak_timestamp, volume_24h_at_peak, liquidity_usd, holders_24h,
                narrative_tags, complete
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chain, address) DO UPDATE SET
                platform = excluded.platform,
                deploy_timestamp = excluded.deploy_timestamp,
                mcap_1h = excluded.mcap_1h,
                peak_mcap = excluded.peak_mcap,
                peak_timestamp = excluded.peak_timestamp,
                volume_24h_at_peak = excluded.volume_24h_at_peak,
                liquidity_usd = excluded.liquidity_usd,
                holders_24h = excluded.holders_24h,
                narrative_tags = excluded.narrative_tags,
                complete = excluded.complete
            "#,
            params![
                token.token.chain,
                token.token.address,
                token.platform,
                to_ts(token.deploy_timestamp),
                token.mcap_1h,
                token.peak_mcap,
                token.peak_timestamp.map(to_ts),
                token.volume_24h_at_peak,
                token.liquidity_usd,
                token.holders_24h.map(|h| h as i64),
                tags,
                token.complete,
            ],
        )?;
        Ok(())
    }

    async fn load_platform_tokens(&self) -> PipelineResult<Vec<PlatformToken>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT chain, address, platform, deploy_timestamp, mcap_1h, peak_mcap,
                   peak_timestamp, volume_24h_at_peak, liquidity_usd, holders_24h,
                   narrative_tags, complete
            FROM platform_tokens
            ORDER BY deploy_timestamp, chain, address
            "#,
        )?;
        let rows = stmt.query_map([], platform_token_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::composite::{compose, TierLadder};
    use crate::pipeline::types::CallEvent;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn schema_dir() -> String {
        format!("{}/sql", env!("CARGO_MANIFEST_DIR"))
    }

    /// Helper to create a test database with the real schema
    fn create_test_db() -> (NamedTempFile, SqliteSignalStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        let store = SqliteSignalStore::open_with_migrations(&db_path, &schema_dir()).unwrap();
        (temp_file, store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn make_outcome(source: &str, version: u32) -> CallOutcome {
        let mut event = CallEvent::new(source, TokenIdentity::new("base", "0xabc"), t0());
        event.narrative_tags = ["ai".to_string(), "agents".to_string()].into_iter().collect();
        let mut outcome = CallOutcome::pending(&event, t0());
        outcome.version = version;
        outcome.price_at_mention = Some(0.5);
        outcome.holders_at_mention = Some(1200);
        outcome
    }

    #[test]
    fn test_migrations_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();

        run_schema_migrations(&mut conn, &schema_dir()).unwrap();
        run_schema_migrations(&mut conn, &schema_dir()).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('call_outcomes', 'channel_scores', 'convergence_records', 'composite_scores', \
                  'scoring_weights', 'weight_audit', 'platform_tokens')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }

    #[test]
    fn test_missing_schema_dir() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        let err = run_schema_migrations(&mut conn, "/nonexistent/schema").unwrap_err();
        assert!(matches!(err, PipelineError::SchemaNotFound(_)));
    }

    #[tokio::test]
    async fn test_outcomes_latest_version_wins() {
        let (_temp, store) = create_test_db();

        let v1 = make_outcome("alpha", 1);
        let mut v2 = make_outcome("alpha", 2);
        v2.price_peak = Some(2.0);
        v2.peak_timestamp = Some(t0() + Duration::hours(3));
        v2.roi_if_sold_at_peak = Some(3.0);
        v2.state = ResolutionState::Resolved;

        store.append_outcome(&v1).await.unwrap();
        store.append_outcome(&v2).await.unwrap();
        // Same version again is ignored
        store.append_outcome(&v1).await.unwrap();
        store.append_outcome(&make_outcome("beta", 1)).await.unwrap();

        let latest = store.latest_outcomes().await.unwrap();
        assert_eq!(latest.len(), 2);
        let alpha = latest.iter().find(|o| o.source_id == "alpha").unwrap();
        assert_eq!(alpha, &v2);

        let by_key = store.latest_outcome(&v1.key()).await.unwrap().unwrap();
        assert_eq!(by_key.version, 2);

        // Nothing was updated in place
        let conn = store.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM call_outcomes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_reused_version_with_new_data_is_a_conflict() {
        let (_temp, store) = create_test_db();
        let v1 = make_outcome("alpha", 1);
        store.append_outcome(&v1).await.unwrap();

        let conn = store.conn.lock().unwrap();
        assert_eq!(insert_outcome(&conn, &v1).unwrap(), OutcomeWrite::Duplicate);

        let mut rewritten = v1.clone();
        rewritten.price_at_mention = Some(0.9);
        assert_eq!(insert_outcome(&conn, &rewritten).unwrap(), OutcomeWrite::Conflict);

        // The first write of v1 is kept
        let price: f64 = conn
            .query_row(
                "SELECT price_at_mention FROM call_outcomes WHERE version = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(price, 0.5);

        assert_eq!(
            insert_outcome(&conn, &make_outcome("alpha", 2)).unwrap(),
            OutcomeWrite::Inserted
        );
    }

    #[tokio::test]
    async fn test_missing_samples_stay_null() {
        let (_temp, store) = create_test_db();
        let outcome = make_outcome("alpha", 1);
        store.append_outcome(&outcome).await.unwrap();

        let loaded = store.latest_outcome(&outcome.key()).await.unwrap().unwrap();
        assert!(loaded.price_1h.is_none());
        assert!(loaded.price_peak.is_none());
        assert!(loaded.roi_if_sold_at_peak.is_none());
        assert_eq!(loaded.narrative_tags.len(), 2);
        assert_eq!(loaded.holders_at_mention, Some(1200));
    }

    #[tokio::test]
    async fn test_channel_scores_full_replace() {
        let (_temp, store) = create_test_db();

        let mut a = ChannelScore::insufficient("alpha", 2, t0());
        a.total_calls = 8;
        a.quality_score = 71.5;
        a.best_mcap_range = Some(McapBucket::From100KTo500K);
        a.best_platform = Some("clanker".to_string());
        let b = ChannelScore::insufficient("beta", 0, t0());

        store.replace_channel_scores(&[a.clone(), b]).await.unwrap();
        assert_eq!(store.load_channel_scores().await.unwrap().len(), 2);

        store.replace_channel_scores(&[a.clone()]).await.unwrap();
        let loaded = store.load_channel_scores().await.unwrap();
        assert_eq!(loaded, vec![a]);
    }

    #[tokio::test]
    async fn test_convergence_records_roundtrip() {
        let (_temp, store) = create_test_db();
        let record = ConvergenceRecord {
            token: TokenIdentity::new("solana", "Mint111"),
            episode_start: t0(),
            contributors: vec![
                ("alpha".to_string(), t0()),
                ("beta".to_string(), t0() + Duration::seconds(90)),
            ],
            recorded_at: t0() + Duration::seconds(90),
        };

        store.append_convergence_records(&[record.clone()]).await.unwrap();
        store.append_convergence_records(&[]).await.unwrap();

        assert_eq!(store.load_convergence_records().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_composite_append_only() {
        let (_temp, store) = create_test_db();
        let token = TokenIdentity::new("base", "0xabc");
        let inputs = SubScores {
            narrative: 50.0,
            profile: 60.0,
            platform: 50.0,
            market: 45.0,
            depth: 75.0,
            wallet: 0.0,
            tg_signal: 88.0,
        };
        let first = compose(&token, t0(), &inputs, &ScoringWeights::default(), &TierLadder::default());
        let second = compose(
            &token,
            t0() + Duration::minutes(5),
            &inputs,
            &ScoringWeights::default(),
            &TierLadder::default(),
        );

        store.append_composite(&first).await.unwrap();
        store.append_composite(&second).await.unwrap();

        let recent = store.recent_composites(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], second);
        assert_eq!(recent[1], first);
    }

    #[tokio::test]
    async fn test_weights_saved_with_audit() {
        let (_temp, store) = create_test_db();
        assert!(store.load_weights().await.unwrap().is_none());

        let before = ScoringWeights::default();
        let after = ScoringWeights::from_array([0.15, 0.15, 0.15, 0.15, 0.10, 0.10, 0.20], 2);
        let record = WeightAuditRecord {
            before,
            after: after.clone(),
            justification: WeightJustification {
                statistic: 3.0,
                previous_statistic: Some(0.0),
                period_start: t0() - Duration::days(7),
                period_end: t0(),
                reason: "test".to_string(),
            },
            recorded_at: t0(),
        };

        store.save_weights(&record).await.unwrap();
        assert_eq!(store.load_weights().await.unwrap(), Some(after));
        assert_eq!(store.load_weight_audit().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_platform_token_upsert() {
        let (_temp, store) = create_test_db();
        let mut token = PlatformToken {
            token: TokenIdentity::new("base", "0xfeed"),
            platform: "clanker".to_string(),
            deploy_timestamp: t0(),
            mcap_1h: Some(80_000.0),
            peak_mcap: None,
            peak_timestamp: None,
            volume_24h_at_peak: None,
            liquidity_usd: Some(25_000.0),
            holders_24h: None,
            narrative_tags: BTreeSet::new(),
            complete: false,
        };
        store.upsert_platform_token(&token).await.unwrap();

        token.peak_mcap = Some(400_000.0);
        token.peak_timestamp = Some(t0() + Duration::hours(4));
        token.complete = true;
        store.upsert_platform_token(&token).await.unwrap();

        assert_eq!(store.load_platform_tokens().await.unwrap(), vec![token]);
    }
}

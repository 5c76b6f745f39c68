//! Persistence layer.
//!
//! SQLite-backed record store for picks, consensus records,
//! calibrations, combination stats, and factor outcomes. All writes
//! are per-entity upserts keyed by id or natural key — entity
//! invariants are enforced by single-row update rules, so no
//! multi-row transactions are needed.
//!
//! Dates are stored as RFC3339 TEXT (lexicographic order matches
//! chronological order for UTC timestamps); nested structures are
//! stored as JSON TEXT columns.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

use crate::types::{
    Calibration, CombinationStats, ConsensusRecord, FactorOutcome, Pick, PickStatus, QuorumError,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS picks (
        id TEXT PRIMARY KEY,
        backend_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        sector TEXT NOT NULL,
        direction TEXT NOT NULL,
        confidence REAL NOT NULL,
        timeframe TEXT NOT NULL,
        entry_price REAL NOT NULL,
        target_price REAL NOT NULL,
        stop_loss REAL NOT NULL,
        thesis TEXT NOT NULL,
        full_reasoning TEXT NOT NULL,
        factor_assessments TEXT NOT NULL,
        bullish_factors TEXT NOT NULL,
        bearish_factors TEXT NOT NULL,
        risks TEXT NOT NULL,
        catalysts TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        closed_at TEXT,
        closed_price REAL,
        actual_return REAL,
        hit_target INTEGER NOT NULL,
        hit_stop_loss INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_picks_status ON picks(status)",
    "CREATE INDEX IF NOT EXISTS idx_picks_backend ON picks(backend_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_picks_symbol ON picks(symbol)",
    "CREATE TABLE IF NOT EXISTS consensus (
        id TEXT PRIMARY KEY,
        symbol TEXT NOT NULL,
        direction TEXT NOT NULL,
        agreeing_backends TEXT NOT NULL,
        combination_key TEXT NOT NULL,
        strength TEXT NOT NULL,
        weighted_confidence REAL NOT NULL,
        blended_confidence REAL NOT NULL,
        reasoning TEXT NOT NULL,
        status TEXT NOT NULL,
        pick_ids TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_consensus_symbol ON consensus(symbol, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_consensus_status ON consensus(status)",
    "CREATE TABLE IF NOT EXISTS calibrations (
        backend_id TEXT NOT NULL,
        calibration_date TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (backend_id, calibration_date)
    )",
    "CREATE TABLE IF NOT EXISTS combination_stats (
        combination_key TEXT PRIMARY KEY,
        times_agreed INTEGER NOT NULL,
        times_correct INTEGER NOT NULL,
        accuracy_rate REAL NOT NULL,
        avg_confidence_when_correct REAL NOT NULL,
        avg_confidence_when_wrong REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS factor_outcomes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        backend_id TEXT NOT NULL,
        factor_id TEXT NOT NULL,
        factor_name TEXT NOT NULL,
        sector TEXT NOT NULL,
        won INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_factor_outcomes_backend ON factor_outcomes(backend_id, factor_id)",
];

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Equality filter for pick queries. All fields optional; omitted
/// fields don't constrain.
#[derive(Debug, Clone, Default)]
pub struct PickFilter {
    pub symbol: Option<String>,
    pub status: Option<PickStatus>,
    pub backend_id: Option<String>,
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> QuorumError {
    QuorumError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> QuorumError {
    QuorumError::Storage(format!("JSON column: {e}"))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, QuorumError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QuorumError::Storage(format!("bad timestamp {s:?}: {e}")))
}

impl Store {
    /// Open (or create) the database at `path` and run the schema.
    pub async fn open(path: &str) -> Result<Self, QuorumError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(db_err)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.init().await?;
        info!(path, "Storage ready");
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps the
    /// database alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self, QuorumError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), QuorumError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    // -- Picks -------------------------------------------------------------

    /// Insert or update a pick. Creation-time fields (prices, prompt
    /// text, expiry) are write-once: the conflict branch only touches
    /// settlement columns, so settled values can never rewrite the
    /// original levels.
    pub async fn upsert_pick(&self, pick: &Pick) -> Result<(), QuorumError> {
        let factors = serde_json::to_string(&pick.factor_assessments).map_err(json_err)?;
        let bullish = serde_json::to_string(&pick.bullish_factors).map_err(json_err)?;
        let bearish = serde_json::to_string(&pick.bearish_factors).map_err(json_err)?;
        let risks = serde_json::to_string(&pick.risks).map_err(json_err)?;
        let catalysts = serde_json::to_string(&pick.catalysts).map_err(json_err)?;

        sqlx::query(
            "INSERT INTO picks (
                id, backend_id, symbol, sector, direction, confidence, timeframe,
                entry_price, target_price, stop_loss, thesis, full_reasoning,
                factor_assessments, bullish_factors, bearish_factors, risks, catalysts,
                status, created_at, expires_at, closed_at, closed_price, actual_return,
                hit_target, hit_stop_loss
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                closed_at = excluded.closed_at,
                closed_price = excluded.closed_price,
                actual_return = excluded.actual_return,
                hit_target = excluded.hit_target,
                hit_stop_loss = excluded.hit_stop_loss",
        )
        .bind(&pick.id)
        .bind(&pick.backend_id)
        .bind(&pick.symbol)
        .bind(&pick.sector)
        .bind(pick.direction.to_string())
        .bind(pick.confidence)
        .bind(pick.timeframe.to_string())
        .bind(pick.entry_price)
        .bind(pick.target_price)
        .bind(pick.stop_loss)
        .bind(&pick.thesis)
        .bind(&pick.full_reasoning)
        .bind(factors)
        .bind(bullish)
        .bind(bearish)
        .bind(risks)
        .bind(catalysts)
        .bind(pick.status.to_string())
        .bind(pick.created_at.to_rfc3339())
        .bind(pick.expires_at.to_rfc3339())
        .bind(pick.closed_at.map(|t| t.to_rfc3339()))
        .bind(pick.closed_price)
        .bind(pick.actual_return)
        .bind(pick.hit_target)
        .bind(pick.hit_stop_loss)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(pick_id = %pick.id, status = %pick.status, "Pick upserted");
        Ok(())
    }

    pub async fn get_pick(&self, id: &str) -> Result<Option<Pick>, QuorumError> {
        let row = sqlx::query("SELECT * FROM picks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|r| Self::pick_from_row(&r)).transpose()
    }

    /// Query picks by equality filter, newest first.
    pub async fn query_picks(&self, filter: &PickFilter) -> Result<Vec<Pick>, QuorumError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM picks WHERE 1=1");

        if let Some(symbol) = &filter.symbol {
            qb.push(" AND symbol = ").push_bind(symbol.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(backend) = &filter.backend_id {
            qb.push(" AND backend_id = ").push_bind(backend.clone());
        }
        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(Self::pick_from_row).collect()
    }

    /// All PENDING picks (the resolver narrows by expiry/crossing).
    pub async fn pending_picks(&self) -> Result<Vec<Pick>, QuorumError> {
        self.query_picks(&PickFilter {
            status: Some(PickStatus::Pending),
            ..Default::default()
        })
        .await
    }

    /// Settled picks for one backend closed at or after `since`,
    /// oldest first.
    pub async fn settled_picks_for_backend(
        &self,
        backend_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Pick>, QuorumError> {
        let rows = sqlx::query(
            "SELECT * FROM picks
             WHERE backend_id = ? AND status != 'PENDING' AND closed_at >= ?
             ORDER BY closed_at ASC",
        )
        .bind(backend_id)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::pick_from_row).collect()
    }

    pub async fn count_settled_since(
        &self,
        backend_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, QuorumError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM picks
             WHERE backend_id = ? AND status != 'PENDING' AND closed_at >= ?",
        )
        .bind(backend_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(n as u64)
    }

    /// Backend ids that have any settled history.
    pub async fn backends_with_settled_picks(&self) -> Result<Vec<String>, QuorumError> {
        let rows = sqlx::query(
            "SELECT DISTINCT backend_id FROM picks WHERE status != 'PENDING' ORDER BY backend_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("backend_id").map_err(db_err))
            .collect()
    }

    fn pick_from_row(row: &SqliteRow) -> Result<Pick, QuorumError> {
        let direction: String = row.try_get("direction").map_err(db_err)?;
        let timeframe: String = row.try_get("timeframe").map_err(db_err)?;
        let status: String = row.try_get("status").map_err(db_err)?;
        let created_at: String = row.try_get("created_at").map_err(db_err)?;
        let expires_at: String = row.try_get("expires_at").map_err(db_err)?;
        let closed_at: Option<String> = row.try_get("closed_at").map_err(db_err)?;

        let factors: String = row.try_get("factor_assessments").map_err(db_err)?;
        let bullish: String = row.try_get("bullish_factors").map_err(db_err)?;
        let bearish: String = row.try_get("bearish_factors").map_err(db_err)?;
        let risks: String = row.try_get("risks").map_err(db_err)?;
        let catalysts: String = row.try_get("catalysts").map_err(db_err)?;

        Ok(Pick {
            id: row.try_get("id").map_err(db_err)?,
            backend_id: row.try_get("backend_id").map_err(db_err)?,
            symbol: row.try_get("symbol").map_err(db_err)?,
            sector: row.try_get("sector").map_err(db_err)?,
            direction: direction
                .parse()
                .map_err(|e| QuorumError::Storage(format!("{e}")))?,
            confidence: row.try_get("confidence").map_err(db_err)?,
            timeframe: timeframe
                .parse()
                .map_err(|e| QuorumError::Storage(format!("{e}")))?,
            entry_price: row.try_get("entry_price").map_err(db_err)?,
            target_price: row.try_get("target_price").map_err(db_err)?,
            stop_loss: row.try_get("stop_loss").map_err(db_err)?,
            thesis: row.try_get("thesis").map_err(db_err)?,
            full_reasoning: row.try_get("full_reasoning").map_err(db_err)?,
            factor_assessments: serde_json::from_str(&factors).map_err(json_err)?,
            bullish_factors: serde_json::from_str(&bullish).map_err(json_err)?,
            bearish_factors: serde_json::from_str(&bearish).map_err(json_err)?,
            risks: serde_json::from_str(&risks).map_err(json_err)?,
            catalysts: serde_json::from_str(&catalysts).map_err(json_err)?,
            status: status
                .parse()
                .map_err(|e| QuorumError::Storage(format!("{e}")))?,
            created_at: parse_ts(&created_at)?,
            expires_at: parse_ts(&expires_at)?,
            closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
            closed_price: row.try_get("closed_price").map_err(db_err)?,
            actual_return: row.try_get("actual_return").map_err(db_err)?,
            hit_target: row.try_get("hit_target").map_err(db_err)?,
            hit_stop_loss: row.try_get("hit_stop_loss").map_err(db_err)?,
        })
    }

    // -- Consensus ----------------------------------------------------------

    pub async fn upsert_consensus(&self, record: &ConsensusRecord) -> Result<(), QuorumError> {
        let agreeing = serde_json::to_string(&record.agreeing_backends).map_err(json_err)?;
        let pick_ids = serde_json::to_string(&record.pick_ids).map_err(json_err)?;

        sqlx::query(
            "INSERT INTO consensus (
                id, symbol, direction, agreeing_backends, combination_key, strength,
                weighted_confidence, blended_confidence, reasoning, status, pick_ids, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET status = excluded.status",
        )
        .bind(&record.id)
        .bind(&record.symbol)
        .bind(record.direction.to_string())
        .bind(agreeing)
        .bind(&record.combination_key)
        .bind(record.strength.to_string())
        .bind(record.weighted_confidence)
        .bind(record.blended_confidence)
        .bind(&record.reasoning)
        .bind(record.status.to_string())
        .bind(pick_ids)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn latest_consensus(
        &self,
        symbol: &str,
    ) -> Result<Option<ConsensusRecord>, QuorumError> {
        let row = sqlx::query(
            "SELECT * FROM consensus WHERE symbol = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| Self::consensus_from_row(&r)).transpose()
    }

    /// All consensus records still awaiting settlement.
    pub async fn pending_consensus(&self) -> Result<Vec<ConsensusRecord>, QuorumError> {
        let rows = sqlx::query("SELECT * FROM consensus WHERE status = 'PENDING'")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(Self::consensus_from_row).collect()
    }

    fn consensus_from_row(row: &SqliteRow) -> Result<ConsensusRecord, QuorumError> {
        let direction: String = row.try_get("direction").map_err(db_err)?;
        let strength: String = row.try_get("strength").map_err(db_err)?;
        let status: String = row.try_get("status").map_err(db_err)?;
        let agreeing: String = row.try_get("agreeing_backends").map_err(db_err)?;
        let pick_ids: String = row.try_get("pick_ids").map_err(db_err)?;
        let created_at: String = row.try_get("created_at").map_err(db_err)?;

        let strength = match strength.as_str() {
            "STRONG" => crate::types::ConsensusStrength::Strong,
            "MODERATE" => crate::types::ConsensusStrength::Moderate,
            "WEAK" => crate::types::ConsensusStrength::Weak,
            "SPLIT" => crate::types::ConsensusStrength::Split,
            other => {
                return Err(QuorumError::Storage(format!(
                    "unknown consensus strength {other:?}",
                )))
            }
        };

        Ok(ConsensusRecord {
            id: row.try_get("id").map_err(db_err)?,
            symbol: row.try_get("symbol").map_err(db_err)?,
            direction: direction
                .parse()
                .map_err(|e| QuorumError::Storage(format!("{e}")))?,
            agreeing_backends: serde_json::from_str(&agreeing).map_err(json_err)?,
            combination_key: row.try_get("combination_key").map_err(db_err)?,
            strength,
            weighted_confidence: row.try_get("weighted_confidence").map_err(db_err)?,
            blended_confidence: row.try_get("blended_confidence").map_err(db_err)?,
            reasoning: row.try_get("reasoning").map_err(db_err)?,
            status: status
                .parse()
                .map_err(|e| QuorumError::Storage(format!("{e}")))?,
            pick_ids: serde_json::from_str(&pick_ids).map_err(json_err)?,
            created_at: parse_ts(&created_at)?,
        })
    }

    // -- Calibrations --------------------------------------------------------

    /// Insert a new calibration row. Rows are immutable — a duplicate
    /// natural key is a storage error, never an overwrite.
    pub async fn insert_calibration(&self, cal: &Calibration) -> Result<(), QuorumError> {
        let payload = serde_json::to_string(cal).map_err(json_err)?;

        sqlx::query(
            "INSERT INTO calibrations (backend_id, calibration_date, payload) VALUES (?, ?, ?)",
        )
        .bind(&cal.backend_id)
        .bind(cal.calibration_date.to_rfc3339())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn latest_calibration(
        &self,
        backend_id: &str,
    ) -> Result<Option<Calibration>, QuorumError> {
        let row = sqlx::query(
            "SELECT payload FROM calibrations
             WHERE backend_id = ? ORDER BY calibration_date DESC LIMIT 1",
        )
        .bind(backend_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| {
            let payload: String = r.try_get("payload").map_err(db_err)?;
            serde_json::from_str(&payload).map_err(json_err)
        })
        .transpose()
    }

    pub async fn calibration_count(&self, backend_id: &str) -> Result<u64, QuorumError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM calibrations WHERE backend_id = ?")
            .bind(backend_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(n as u64)
    }

    // -- Combination stats ----------------------------------------------------

    pub async fn get_combination_stats(
        &self,
        combination_key: &str,
    ) -> Result<Option<CombinationStats>, QuorumError> {
        let row = sqlx::query("SELECT * FROM combination_stats WHERE combination_key = ?")
            .bind(combination_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|r| {
            Ok(CombinationStats {
                combination_key: r.try_get("combination_key").map_err(db_err)?,
                times_agreed: r.try_get::<i64, _>("times_agreed").map_err(db_err)? as u32,
                times_correct: r.try_get::<i64, _>("times_correct").map_err(db_err)? as u32,
                accuracy_rate: r.try_get("accuracy_rate").map_err(db_err)?,
                avg_confidence_when_correct: r
                    .try_get("avg_confidence_when_correct")
                    .map_err(db_err)?,
                avg_confidence_when_wrong: r
                    .try_get("avg_confidence_when_wrong")
                    .map_err(db_err)?,
            })
        })
        .transpose()
    }

    pub async fn upsert_combination_stats(
        &self,
        stats: &CombinationStats,
    ) -> Result<(), QuorumError> {
        sqlx::query(
            "INSERT INTO combination_stats (
                combination_key, times_agreed, times_correct, accuracy_rate,
                avg_confidence_when_correct, avg_confidence_when_wrong
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(combination_key) DO UPDATE SET
                times_agreed = excluded.times_agreed,
                times_correct = excluded.times_correct,
                accuracy_rate = excluded.accuracy_rate,
                avg_confidence_when_correct = excluded.avg_confidence_when_correct,
                avg_confidence_when_wrong = excluded.avg_confidence_when_wrong",
        )
        .bind(&stats.combination_key)
        .bind(stats.times_agreed as i64)
        .bind(stats.times_correct as i64)
        .bind(stats.accuracy_rate)
        .bind(stats.avg_confidence_when_correct)
        .bind(stats.avg_confidence_when_wrong)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    // -- Factor outcomes --------------------------------------------------------

    pub async fn insert_factor_outcomes(
        &self,
        outcomes: &[FactorOutcome],
    ) -> Result<(), QuorumError> {
        for outcome in outcomes {
            sqlx::query(
                "INSERT INTO factor_outcomes
                 (backend_id, factor_id, factor_name, sector, won, recorded_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&outcome.backend_id)
            .bind(&outcome.factor_id)
            .bind(&outcome.factor_name)
            .bind(&outcome.sector)
            .bind(outcome.won)
            .bind(outcome.recorded_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    pub async fn factor_outcomes_for_backend(
        &self,
        backend_id: &str,
    ) -> Result<Vec<FactorOutcome>, QuorumError> {
        let rows = sqlx::query(
            "SELECT backend_id, factor_id, factor_name, sector, won, recorded_at
             FROM factor_outcomes WHERE backend_id = ? ORDER BY recorded_at ASC",
        )
        .bind(backend_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                let recorded_at: String = r.try_get("recorded_at").map_err(db_err)?;
                Ok(FactorOutcome {
                    backend_id: r.try_get("backend_id").map_err(db_err)?,
                    factor_id: r.try_get("factor_id").map_err(db_err)?,
                    factor_name: r.try_get("factor_name").map_err(db_err)?,
                    sector: r.try_get("sector").map_err(db_err)?,
                    won: r.try_get("won").map_err(db_err)?,
                    recorded_at: parse_ts(&recorded_at)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// =============================================================================
// Durable Store — SQLite via sqlx
// =============================================================================
//
// Owns the five engine tables: candles, volatility, correlation, best_pairs,
// job_log. All writes are keyed upserts (best_pairs excepted — it is a
// snapshot-per-run append), so a partially completed job re-runs safely at
// the next tick. There is deliberately no cross-table transaction per job;
// idempotent keying is the recovery mechanism.
//
// Prices are persisted as fixed-scale decimal TEXT (5 dp, round-half-even;
// HV values 6 dp) so nothing is lost to float representation.

pub mod candles;
pub mod job_log;
pub mod metrics;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::error::StoreError;

pub use candles::{CandleRecord, StoredCandle};
pub use job_log::{JobHandle, JobRunRow, JobStatus};
pub use metrics::{BestPairRow, CorrelationRow, VolatilityRow};

/// Bounded connection pool over the engine database.
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) pool: Pool<Sqlite>,
}

impl Store {
    /// Connect to (or create) the database behind `dsn`.
    ///
    /// File-backed databases run in WAL mode with a generous busy timeout;
    /// in-memory databases (tests) keep a single connection so every query
    /// sees the same data.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let in_memory = dsn.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| StoreError::Unavailable(format!("bad store DSN: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        if !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        info!(in_memory, "store connected");
        Ok(Self { pool })
    }

    /// Create the engine tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("store schema ready");
        Ok(())
    }
}

/// Engine schema. `(instrument, time, granularity)`, `(instrument, time)` and
/// `(pair1, pair2, time)` uniqueness back the idempotent upserts; the CHECK
/// on correlation enforces canonical pair ordering at the storage boundary
/// as well as in code.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS candles (
        instrument  TEXT    NOT NULL,
        time        TEXT    NOT NULL,
        granularity TEXT    NOT NULL,
        open_bid    TEXT    NOT NULL,
        high_bid    TEXT    NOT NULL,
        low_bid     TEXT    NOT NULL,
        close_bid   TEXT    NOT NULL,
        open_ask    TEXT    NOT NULL,
        high_ask    TEXT    NOT NULL,
        low_ask     TEXT    NOT NULL,
        close_ask   TEXT    NOT NULL,
        open_mid    TEXT    NOT NULL,
        high_mid    TEXT    NOT NULL,
        low_mid     TEXT    NOT NULL,
        close_mid   TEXT    NOT NULL,
        volume      INTEGER NOT NULL,
        created_at  TEXT    NOT NULL,
        updated_at  TEXT    NOT NULL,
        UNIQUE (instrument, time, granularity)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS volatility (
        instrument  TEXT NOT NULL,
        asset_class TEXT NOT NULL,
        time        TEXT NOT NULL,
        hv20        TEXT,
        hv50        TEXT,
        sma15       TEXT,
        sma30       TEXT,
        sma50       TEXT,
        bb_upper    TEXT,
        bb_middle   TEXT,
        bb_lower    TEXT,
        atr         TEXT,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        UNIQUE (instrument, time)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS correlation (
        pair1       TEXT    NOT NULL,
        pair2       TEXT    NOT NULL,
        time        TEXT    NOT NULL,
        correlation REAL    NOT NULL,
        window_size INTEGER NOT NULL,
        UNIQUE (pair1, pair2, time),
        CHECK (pair1 < pair2)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS best_pairs (
        time        TEXT    NOT NULL,
        pair1       TEXT    NOT NULL,
        pair2       TEXT    NOT NULL,
        correlation REAL    NOT NULL,
        category    TEXT    NOT NULL,
        rank        INTEGER NOT NULL,
        reason      TEXT    NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_log (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        job_name          TEXT NOT NULL,
        start_time        TEXT NOT NULL,
        end_time          TEXT,
        duration_seconds  REAL,
        status            TEXT NOT NULL,
        error_message     TEXT,
        records_processed INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_candles_series ON candles (instrument, granularity, time)",
    "CREATE INDEX IF NOT EXISTS idx_volatility_series ON volatility (instrument, time)",
    "CREATE INDEX IF NOT EXISTS idx_best_pairs_time ON best_pairs (time)",
];

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    let store = Store::connect("sqlite::memory:").await.expect("connect");
    store.migrate().await.expect("migrate");
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = test_store().await;
        store.migrate().await.expect("second migrate");
    }

    #[tokio::test]
    async fn bad_dsn_is_unavailable() {
        let err = Store::connect("postgres://nope").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}

// =============================================================================
// Derived-series persistence — volatility metrics, correlations, best pairs
// =============================================================================

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::Row;
use tracing::debug;

use crate::analytics::best_pairs::RankedPair;
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{AssetClass, Instrument};

/// Fixed scale for persisted prices / price-scale metrics.
const PRICE_SCALE: u32 = 5;
/// Fixed scale for persisted volatility percentages.
const HV_SCALE: u32 = 6;

/// One derived metric row, keyed by `(instrument, time)`. Every metric is
/// optional: a window without enough samples is simply absent, never zero.
#[derive(Debug, Clone)]
pub struct VolatilityRow {
    pub instrument: Instrument,
    pub asset_class: AssetClass,
    pub time: DateTime<Utc>,
    pub hv20: Option<Decimal>,
    pub hv50: Option<Decimal>,
    pub sma15: Option<Decimal>,
    pub sma30: Option<Decimal>,
    pub sma50: Option<Decimal>,
    pub bb_upper: Option<Decimal>,
    pub bb_middle: Option<Decimal>,
    pub bb_lower: Option<Decimal>,
    pub atr: Option<Decimal>,
}

impl VolatilityRow {
    /// Round a price-scale metric for persistence (5 dp, half-even).
    pub fn price_metric(value: f64) -> Option<Decimal> {
        Decimal::from_f64(value).map(|d| d.round_dp(PRICE_SCALE))
    }

    /// Round a volatility percentage for persistence (6 dp, half-even).
    pub fn hv_metric(value: f64) -> Option<Decimal> {
        Decimal::from_f64(value).map(|d| d.round_dp(HV_SCALE))
    }

    /// True when no metric could be computed; such rows are not persisted.
    pub fn is_empty(&self) -> bool {
        self.hv20.is_none()
            && self.hv50.is_none()
            && self.sma15.is_none()
            && self.sma30.is_none()
            && self.sma50.is_none()
            && self.bb_upper.is_none()
            && self.atr.is_none()
    }
}

/// One pairwise correlation observation, canonically ordered.
#[derive(Debug, Clone)]
pub struct CorrelationRow {
    pub pair1: Instrument,
    pub pair2: Instrument,
    pub time: DateTime<Utc>,
    pub correlation: f64,
    pub window_size: i64,
}

impl CorrelationRow {
    /// Build a row with canonical `pair1 < pair2` ordering regardless of the
    /// order the caller discovered the pair in.
    pub fn canonical(
        a: Instrument,
        b: Instrument,
        time: DateTime<Utc>,
        correlation: f64,
        window_size: i64,
    ) -> Self {
        let (pair1, pair2) = if a <= b { (a, b) } else { (b, a) };
        Self {
            pair1,
            pair2,
            time,
            correlation,
            window_size,
        }
    }
}

/// One best-pairs snapshot row as read back from the store.
#[derive(Debug, Clone)]
pub struct BestPairRow {
    pub time: DateTime<Utc>,
    pub pair1: String,
    pub pair2: String,
    pub correlation: f64,
    pub category: String,
    pub rank: i64,
    pub reason: String,
}

fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt time column {s:?}: {e}")))
}

impl Store {
    /// Insert or refresh volatility metrics by `(instrument, time)`.
    pub async fn upsert_volatility(&self, rows: &[VolatilityRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let now = fmt_time(&Utc::now());
        let mut written = 0u64;

        let text = |d: &Option<Decimal>| d.map(|v| v.to_string());

        for m in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO volatility (
                    instrument, asset_class, time,
                    hv20, hv50, sma15, sma30, sma50,
                    bb_upper, bb_middle, bb_lower, atr,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (instrument, time) DO UPDATE SET
                    asset_class = excluded.asset_class,
                    hv20 = excluded.hv20,
                    hv50 = excluded.hv50,
                    sma15 = excluded.sma15,
                    sma30 = excluded.sma30,
                    sma50 = excluded.sma50,
                    bb_upper = excluded.bb_upper,
                    bb_middle = excluded.bb_middle,
                    bb_lower = excluded.bb_lower,
                    atr = excluded.atr,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(m.instrument.as_str())
            .bind(m.asset_class.as_str())
            .bind(fmt_time(&m.time))
            .bind(text(&m.hv20))
            .bind(text(&m.hv50))
            .bind(text(&m.sma15))
            .bind(text(&m.sma30))
            .bind(text(&m.sma50))
            .bind(text(&m.bb_upper))
            .bind(text(&m.bb_middle))
            .bind(text(&m.bb_lower))
            .bind(text(&m.atr))
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            written += result.rows_affected();
        }

        debug!(rows = rows.len(), written, "volatility metrics upserted");
        Ok(written)
    }

    /// Insert correlation rows by `(pair1, pair2, time)`.
    ///
    /// Canonical pair ordering and the rho range are enforced here, before
    /// any SQL runs; a violation is a caller bug and surfaces as
    /// [`StoreError::Invariant`] naming the offending row.
    pub async fn insert_correlation(&self, rows: &[CorrelationRow]) -> Result<u64, StoreError> {
        for r in rows {
            if r.pair1 >= r.pair2 {
                return Err(StoreError::Invariant(format!(
                    "correlation pair not canonically ordered: {} >= {}",
                    r.pair1, r.pair2
                )));
            }
            if !(-1.0..=1.0).contains(&r.correlation) {
                return Err(StoreError::Invariant(format!(
                    "correlation out of range for ({}, {}): {}",
                    r.pair1, r.pair2, r.correlation
                )));
            }
        }

        let mut written = 0u64;
        for r in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO correlation (pair1, pair2, time, correlation, window_size)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (pair1, pair2, time) DO UPDATE SET
                    correlation = excluded.correlation,
                    window_size = excluded.window_size
                "#,
            )
            .bind(r.pair1.as_str())
            .bind(r.pair2.as_str())
            .bind(fmt_time(&r.time))
            .bind(r.correlation)
            .bind(r.window_size)
            .execute(&self.pool)
            .await?;
            written += result.rows_affected();
        }

        debug!(rows = rows.len(), "correlation entries written");
        Ok(written)
    }

    /// Append a best-pairs snapshot. No upsert: each run writes a fresh set
    /// tagged by its snapshot time.
    pub async fn append_best_pairs(
        &self,
        time: &DateTime<Utc>,
        rows: &[RankedPair],
    ) -> Result<u64, StoreError> {
        let mut written = 0u64;
        for r in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO best_pairs (time, pair1, pair2, correlation, category, rank, reason)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(fmt_time(time))
            .bind(r.pair1.as_str())
            .bind(r.pair2.as_str())
            .bind(r.correlation)
            .bind(r.category.as_str())
            .bind(r.rank)
            .bind(r.reason.as_str())
            .execute(&self.pool)
            .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    /// Best-pairs rows at a snapshot time (rank order within category).
    pub async fn get_best_pairs(
        &self,
        time: &DateTime<Utc>,
    ) -> Result<Vec<BestPairRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT time, pair1, pair2, correlation, category, rank, reason
            FROM best_pairs
            WHERE time = ?
            ORDER BY category, rank
            "#,
        )
        .bind(fmt_time(time))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(BestPairRow {
                time: parse_time(row.get("time"))?,
                pair1: row.get::<String, _>("pair1"),
                pair2: row.get::<String, _>("pair2"),
                correlation: row.get("correlation"),
                category: row.get::<String, _>("category"),
                rank: row.get("rank"),
                reason: row.get::<String, _>("reason"),
            });
        }
        Ok(out)
    }

    /// Latest volatility row for an instrument, if any.
    pub async fn get_latest_volatility(
        &self,
        instrument: &Instrument,
    ) -> Result<Option<VolatilityRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT instrument, asset_class, time,
                   hv20, hv50, sma15, sma30, sma50,
                   bb_upper, bb_middle, bb_lower, atr
            FROM volatility
            WHERE instrument = ?
            ORDER BY time DESC
            LIMIT 1
            "#,
        )
        .bind(instrument.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let dec = |name: &str| -> Result<Option<Decimal>, StoreError> {
            let raw: Option<String> = row.get(name);
            raw.map(|s| {
                s.parse::<Decimal>()
                    .map_err(|e| StoreError::Unavailable(format!("corrupt {name} column: {e}")))
            })
            .transpose()
        };

        Ok(Some(VolatilityRow {
            instrument: instrument.clone(),
            asset_class: match row.get::<&str, _>("asset_class") {
                "METAL" => AssetClass::Metal,
                "CFD" => AssetClass::Cfd,
                _ => AssetClass::Fx,
            },
            time: parse_time(row.get("time"))?,
            hv20: dec("hv20")?,
            hv50: dec("hv50")?,
            sma15: dec("sma15")?,
            sma30: dec("sma30")?,
            sma50: dec("sma50")?,
            bb_upper: dec("bb_upper")?,
            bb_middle: dec("bb_middle")?,
            bb_lower: dec("bb_lower")?,
            atr: dec("atr")?,
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::best_pairs::classify_and_rank;
    use crate::store::test_store;
    use chrono::TimeZone;

    fn inst(s: &str) -> Instrument {
        Instrument::new(s).unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    fn metric_row(hour: u32, hv20: Option<f64>) -> VolatilityRow {
        VolatilityRow {
            instrument: inst("EUR_USD"),
            asset_class: AssetClass::Fx,
            time: at(hour),
            hv20: hv20.and_then(VolatilityRow::hv_metric),
            hv50: None,
            sma15: VolatilityRow::price_metric(1.1),
            sma30: None,
            sma50: None,
            bb_upper: VolatilityRow::price_metric(1.12),
            bb_middle: VolatilityRow::price_metric(1.1),
            bb_lower: VolatilityRow::price_metric(1.08),
            atr: VolatilityRow::price_metric(0.003),
        }
    }

    #[tokio::test]
    async fn volatility_upsert_is_idempotent() {
        let store = test_store().await;
        let row = metric_row(9, Some(1.234567));
        store.upsert_volatility(&[row.clone()]).await.unwrap();
        store.upsert_volatility(&[row]).await.unwrap();

        let latest = store
            .get_latest_volatility(&inst("EUR_USD"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.time, at(9));
        assert_eq!(latest.hv20, Some("1.234567".parse().unwrap()));
        assert_eq!(latest.hv50, None);
    }

    #[tokio::test]
    async fn volatility_upsert_replaces_fields() {
        let store = test_store().await;
        store
            .upsert_volatility(&[metric_row(9, Some(1.0))])
            .await
            .unwrap();
        store
            .upsert_volatility(&[metric_row(9, Some(2.5))])
            .await
            .unwrap();

        let latest = store
            .get_latest_volatility(&inst("EUR_USD"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.hv20, Some("2.500000".parse().unwrap()));
    }

    #[tokio::test]
    async fn correlation_rejects_unordered_pairs() {
        let store = test_store().await;
        let bad = CorrelationRow {
            pair1: inst("GBP_USD"),
            pair2: inst("EUR_USD"), // wrong order
            time: at(0),
            correlation: 0.5,
            window_size: 100,
        };
        let err = store.insert_correlation(&[bad]).await.unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
    }

    #[tokio::test]
    async fn correlation_rejects_out_of_range_rho() {
        let store = test_store().await;
        let bad = CorrelationRow {
            pair1: inst("EUR_USD"),
            pair2: inst("GBP_USD"),
            time: at(0),
            correlation: 1.5,
            window_size: 100,
        };
        assert!(matches!(
            store.insert_correlation(&[bad]).await.unwrap_err(),
            StoreError::Invariant(_)
        ));
    }

    #[tokio::test]
    async fn canonical_ordering_never_trips_the_check() {
        // Whatever order pairs arrive in, canonical() must satisfy the store.
        let names = ["USD_JPY", "EUR_USD", "GBP_USD", "AUD_USD", "XAU_USD"];
        let store = test_store().await;
        let mut rows = Vec::new();
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                // Deliberately reversed arguments.
                rows.push(CorrelationRow::canonical(
                    inst(b),
                    inst(a),
                    at(0),
                    0.25,
                    100,
                ));
            }
        }
        let written = store.insert_correlation(&rows).await.unwrap();
        assert_eq!(written as usize, rows.len());
    }

    #[tokio::test]
    async fn correlation_reinsert_converges() {
        let store = test_store().await;
        let row = CorrelationRow::canonical(inst("EUR_USD"), inst("GBP_USD"), at(0), 0.91, 100);
        store.insert_correlation(&[row.clone()]).await.unwrap();
        store.insert_correlation(&[row]).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM correlation")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn best_pairs_appends_snapshots() {
        let store = test_store().await;
        let entries = vec![(inst("EUR_USD"), inst("GBP_USD"), 0.92)];
        let ranked = classify_and_rank(&entries, 0.7);

        store.append_best_pairs(&at(0), &ranked).await.unwrap();
        store.append_best_pairs(&at(1), &ranked).await.unwrap();

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM best_pairs")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(total, 2); // one per snapshot, no overwrite

        let snap = store.get_best_pairs(&at(0)).await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].category, "high_correlation");
        assert_eq!(snap[0].rank, 1);
    }

    #[test]
    fn empty_metric_row_is_detected() {
        let row = VolatilityRow {
            instrument: inst("EUR_USD"),
            asset_class: AssetClass::Fx,
            time: at(0),
            hv20: None,
            hv50: None,
            sma15: None,
            sma30: None,
            sma50: None,
            bb_upper: None,
            bb_middle: None,
            bb_lower: None,
            atr: None,
        };
        assert!(row.is_empty());
        assert!(!metric_row(0, Some(1.0)).is_empty());
    }
}

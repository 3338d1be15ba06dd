// =============================================================================
// Candle persistence — idempotent upserts keyed by (instrument, time, granularity)
// =============================================================================

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use tracing::debug;

use crate::broker::{BrokerCandle, Ohlc};
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Granularity, Instrument};

/// Fixed scale for persisted prices.
const PRICE_SCALE: u32 = 5;

/// A fully-sided candle ready for persistence. All three quote sides are
/// present; mid is derived as (bid+ask)/2 when the broker omitted it.
#[derive(Debug, Clone)]
pub struct StoredCandle {
    pub instrument: Instrument,
    pub time: DateTime<Utc>,
    pub granularity: Granularity,
    pub bid: Ohlc,
    pub ask: Ohlc,
    pub mid: Ohlc,
    pub volume: i64,
}

/// A candle as read back from the store, including its audit timestamps.
#[derive(Debug, Clone)]
pub struct CandleRecord {
    pub candle: StoredCandle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredCandle {
    /// Convert a broker candle, deriving mid if absent and checking the OHLC
    /// ordering invariant on every present side. Returns a description of
    /// the defect on failure so the caller can log and skip the candle.
    pub fn from_broker(
        instrument: &Instrument,
        granularity: Granularity,
        raw: &BrokerCandle,
    ) -> Result<Self, String> {
        let bid = raw.bid.ok_or("missing bid side")?;
        let ask = raw.ask.ok_or("missing ask side")?;
        let mid = raw.mid.unwrap_or_else(|| midpoint(&bid, &ask));

        for (name, side) in [("bid", &bid), ("ask", &ask), ("mid", &mid)] {
            check_ohlc(name, side)?;
        }
        for (field, b, a) in [
            ("open", bid.open, ask.open),
            ("high", bid.high, ask.high),
            ("low", bid.low, ask.low),
            ("close", bid.close, ask.close),
        ] {
            if b > a {
                return Err(format!("bid {field} {b} exceeds ask {field} {a}"));
            }
        }

        Ok(Self {
            instrument: instrument.clone(),
            time: raw.time,
            granularity,
            bid,
            ask,
            mid,
            volume: raw.volume,
        })
    }
}

fn midpoint(bid: &Ohlc, ask: &Ohlc) -> Ohlc {
    let two = Decimal::from(2);
    Ohlc {
        open: (bid.open + ask.open) / two,
        high: (bid.high + ask.high) / two,
        low: (bid.low + ask.low) / two,
        close: (bid.close + ask.close) / two,
    }
}

fn check_ohlc(name: &str, side: &Ohlc) -> Result<(), String> {
    let body_low = side.open.min(side.close);
    let body_high = side.open.max(side.close);
    if side.low > body_low || body_high > side.high {
        return Err(format!(
            "{name} side violates low <= open/close <= high: o={} h={} l={} c={}",
            side.open, side.high, side.low, side.close
        ));
    }
    Ok(())
}

fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn fmt_price(d: Decimal) -> String {
    d.round_dp(PRICE_SCALE).to_string()
}

fn parse_price(s: &str) -> Result<Decimal, StoreError> {
    s.parse()
        .map_err(|e| StoreError::Unavailable(format!("corrupt price column {s:?}: {e}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt time column {s:?}: {e}")))
}

impl Store {
    /// Insert or refresh candles by `(instrument, time, granularity)`.
    ///
    /// Replaces the numeric fields and bumps `updated_at` on conflict;
    /// `created_at` keeps its original value. Safe to call repeatedly with
    /// the same rows — re-running a job converges to the same state.
    pub async fn upsert_candles(&self, rows: &[StoredCandle]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let now = fmt_time(&Utc::now());
        let mut written = 0u64;

        for c in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO candles (
                    instrument, time, granularity,
                    open_bid, high_bid, low_bid, close_bid,
                    open_ask, high_ask, low_ask, close_ask,
                    open_mid, high_mid, low_mid, close_mid,
                    volume, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (instrument, time, granularity) DO UPDATE SET
                    open_bid = excluded.open_bid,
                    high_bid = excluded.high_bid,
                    low_bid = excluded.low_bid,
                    close_bid = excluded.close_bid,
                    open_ask = excluded.open_ask,
                    high_ask = excluded.high_ask,
                    low_ask = excluded.low_ask,
                    close_ask = excluded.close_ask,
                    open_mid = excluded.open_mid,
                    high_mid = excluded.high_mid,
                    low_mid = excluded.low_mid,
                    close_mid = excluded.close_mid,
                    volume = excluded.volume,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(c.instrument.as_str())
            .bind(fmt_time(&c.time))
            .bind(c.granularity.as_str())
            .bind(fmt_price(c.bid.open))
            .bind(fmt_price(c.bid.high))
            .bind(fmt_price(c.bid.low))
            .bind(fmt_price(c.bid.close))
            .bind(fmt_price(c.ask.open))
            .bind(fmt_price(c.ask.high))
            .bind(fmt_price(c.ask.low))
            .bind(fmt_price(c.ask.close))
            .bind(fmt_price(c.mid.open))
            .bind(fmt_price(c.mid.high))
            .bind(fmt_price(c.mid.low))
            .bind(fmt_price(c.mid.close))
            .bind(c.volume)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            written += result.rows_affected();
        }

        debug!(rows = rows.len(), written, "candles upserted");
        Ok(written)
    }

    /// Most recent candles for a series, newest-first, at most `limit`.
    pub async fn get_recent_candles(
        &self,
        instrument: &Instrument,
        granularity: Granularity,
        limit: u32,
    ) -> Result<Vec<CandleRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT time,
                   open_bid, high_bid, low_bid, close_bid,
                   open_ask, high_ask, low_ask, close_ask,
                   open_mid, high_mid, low_mid, close_mid,
                   volume, created_at, updated_at
            FROM candles
            WHERE instrument = ? AND granularity = ?
            ORDER BY time DESC
            LIMIT ?
            "#,
        )
        .bind(instrument.as_str())
        .bind(granularity.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let side = |prefix: &str| -> Result<Ohlc, StoreError> {
                Ok(Ohlc {
                    open: parse_price(row.get::<&str, _>(format!("open_{prefix}").as_str()))?,
                    high: parse_price(row.get::<&str, _>(format!("high_{prefix}").as_str()))?,
                    low: parse_price(row.get::<&str, _>(format!("low_{prefix}").as_str()))?,
                    close: parse_price(row.get::<&str, _>(format!("close_{prefix}").as_str()))?,
                })
            };
            out.push(CandleRecord {
                candle: StoredCandle {
                    instrument: instrument.clone(),
                    time: parse_time(row.get("time"))?,
                    granularity,
                    bid: side("bid")?,
                    ask: side("ask")?,
                    mid: side("mid")?,
                    volume: row.get("volume"),
                },
                created_at: parse_time(row.get("created_at"))?,
                updated_at: parse_time(row.get("updated_at"))?,
            });
        }
        Ok(out)
    }

    /// Time-ordered (oldest-first) mid closes for correlation input.
    pub async fn get_recent_closes(
        &self,
        instrument: &Instrument,
        granularity: Granularity,
        window: u32,
    ) -> Result<Vec<(DateTime<Utc>, Decimal)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT time, close_mid
            FROM candles
            WHERE instrument = ? AND granularity = ?
            ORDER BY time DESC
            LIMIT ?
            "#,
        )
        .bind(instrument.as_str())
        .bind(granularity.as_str())
        .bind(i64::from(window))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((
                parse_time(row.get("time"))?,
                parse_price(row.get("close_mid"))?,
            ));
        }
        out.reverse();
        Ok(out)
    }
}

// =============================================================================
// Hourly Ingest Job — fetch, derive, persist, cache, publish
// =============================================================================
//
// Per tracked instrument: pull the last two completed H1 candles (two, so a
// missed previous run heals itself), upsert them, recompute the volatility
// metric set over the stored window, refresh the cache, and publish price /
// volatility-alert messages. One data_ready summary follows every
// per-instrument publish of the run.
//
// Per-instrument failures are caught and logged; the job keeps going. Only
// an auth rejection, a store failure, or a failure ratio above
// MAX_FAILURE_RATIO fails the run as a whole.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info, warn};

use crate::analytics::atr::{atr, AtrBar};
use crate::analytics::bollinger::bollinger;
use crate::analytics::sma::sma;
use crate::analytics::volatility::historical_volatility;
use crate::broker::{CandleSource, PriceSides};
use crate::cache::{BusMessage, Cache, DataReady, DataType, PricePoint, PriceUpdate, VolatilityAlert};
use crate::error::BrokerError;
use crate::jobs::{volatility_severity, JobReport};
use crate::store::{Store, StoredCandle, VolatilityRow};
use crate::types::{Granularity, Instrument};

pub const HOURLY_JOB_NAME: &str = "hourly_ingest";

/// Candles fetched per instrument each run (current + previous bucket).
const FETCH_COUNT: u32 = 2;
/// Stored window loaded for metric derivation.
const ANALYTICS_WINDOW: u32 = 300;
/// Instrument-failure ratio beyond which the whole run is marked failed.
const MAX_FAILURE_RATIO: f64 = 0.3;

pub struct HourlyJob {
    broker: Arc<dyn CandleSource>,
    store: Store,
    cache: Arc<Cache>,
    universe: Vec<Instrument>,
    volatility_threshold: f64,
    concurrency: usize,
}

struct FetchOutcome {
    instrument: Instrument,
    result: Result<u64, String>,
    fatal_auth: bool,
}

impl HourlyJob {
    pub fn new(
        broker: Arc<dyn CandleSource>,
        store: Store,
        cache: Arc<Cache>,
        universe: Vec<Instrument>,
        volatility_threshold: f64,
        concurrency: usize,
    ) -> Self {
        Self {
            broker,
            store,
            cache,
            universe,
            volatility_threshold,
            concurrency: concurrency.max(1),
        }
    }

    /// Execute one run. `logical_now` is the tick's nominal time and stamps
    /// every published message.
    pub async fn run(&self, logical_now: DateTime<Utc>) -> Result<JobReport> {
        info!(at = %logical_now, instruments = self.universe.len(), "hourly ingest starting");

        // ── 1+2. Fetch and upsert, bounded-concurrently ─────────────────
        let outcomes: Vec<FetchOutcome> = stream::iter(self.universe.clone())
            .map(|instrument| self.fetch_and_upsert(instrument))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        if let Some(auth) = outcomes.iter().find(|o| o.fatal_auth) {
            // A rejected token will not heal within this run; fail now and
            // let the next tick retry with whatever credentials it finds.
            return Err(anyhow!(
                "broker rejected credentials while fetching {}",
                auth.instrument
            ));
        }

        let mut records: i64 = 0;
        let mut failed: Vec<(Instrument, String)> = Vec::new();
        for o in &outcomes {
            match &o.result {
                Ok(n) => records += *n as i64,
                Err(reason) => failed.push((o.instrument.clone(), reason.clone())),
            }
        }

        let succeeded: Vec<Instrument> = self
            .universe
            .iter()
            .filter(|i| !failed.iter().any(|(f, _)| &f == i))
            .cloned()
            .collect();

        // ── 3–8. Derive, persist metrics, cache, publish (stable order) ─
        let mut published_prices: u64 = 0;
        for instrument in &succeeded {
            match self.derive_and_publish(instrument, logical_now).await {
                Ok(price_published) => {
                    if price_published {
                        published_prices += 1;
                    }
                }
                Err(e) => {
                    // Store failures are not a per-instrument condition.
                    return Err(e);
                }
            }
        }

        let ready = BusMessage::DataReady(DataReady {
            data_type: DataType::Prices,
            count: succeeded.len() as u64,
            timestamp: logical_now,
            message: None,
        });
        if let Err(e) = self.cache.bus().publish(ready) {
            warn!(error = %e, "data_ready publish failed (continuing)");
        }

        // ── 9. Outcome ──────────────────────────────────────────────────
        let ratio = failed.len() as f64 / self.universe.len().max(1) as f64;
        if ratio > MAX_FAILURE_RATIO {
            let detail: Vec<String> =
                failed.iter().map(|(i, r)| format!("{i}: {r}")).collect();
            return Err(anyhow!(
                "{} of {} instruments failed: {}",
                failed.len(),
                self.universe.len(),
                detail.join("; ")
            ));
        }

        let note = (!failed.is_empty()).then(|| {
            let names: Vec<&str> = failed.iter().map(|(i, _)| i.as_str()).collect();
            format!("partial coverage, skipped: {}", names.join(", "))
        });

        info!(
            records,
            published_prices,
            skipped = failed.len(),
            "hourly ingest finished"
        );
        Ok(JobReport {
            records_processed: records,
            note,
        })
    }

    async fn fetch_and_upsert(&self, instrument: Instrument) -> FetchOutcome {
        let fetched = self
            .broker
            .fetch_candles(&instrument, Granularity::H1, FETCH_COUNT, PriceSides::ALL)
            .await;

        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => {
                let fatal_auth = matches!(e, BrokerError::Auth { .. });
                warn!(instrument = %instrument, error = %e, "candle fetch failed");
                return FetchOutcome {
                    instrument,
                    result: Err(e.to_string()),
                    fatal_auth,
                };
            }
        };

        // Only completed buckets are persisted; the forming candle would be
        // rewritten next tick anyway.
        let mut rows = Vec::with_capacity(raw.len());
        for candle in raw.iter().filter(|c| c.complete) {
            match StoredCandle::from_broker(&instrument, Granularity::H1, candle) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    warn!(instrument = %instrument, time = %candle.time, reason, "discarding malformed candle");
                }
            }
        }

        if rows.is_empty() {
            return FetchOutcome {
                instrument,
                result: Err("no completed candles in response".into()),
                fatal_auth: false,
            };
        }

        match self.store.upsert_candles(&rows).await {
            Ok(n) => FetchOutcome {
                instrument,
                result: Ok(n),
                fatal_auth: false,
            },
            Err(e) => FetchOutcome {
                instrument,
                result: Err(format!("store write failed: {e}")),
                fatal_auth: false,
            },
        }
    }

    /// Derive metrics from the stored window, refresh the cache and publish
    /// for one instrument. Returns whether a price update was published.
    async fn derive_and_publish(
        &self,
        instrument: &Instrument,
        logical_now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut window = self
            .store
            .get_recent_candles(instrument, Granularity::H1, ANALYTICS_WINDOW)
            .await?;
        window.reverse(); // oldest-first for the analytics

        let Some(latest) = window.last().map(|r| r.candle.clone()) else {
            return Ok(false);
        };

        // ── Derive ──────────────────────────────────────────────────────
        let closes: Vec<f64> = window
            .iter()
            .filter_map(|r| r.candle.mid.close.to_f64())
            .collect();
        let bars: Vec<AtrBar> = window
            .iter()
            .filter_map(|r| {
                Some(AtrBar {
                    high: r.candle.mid.high.to_f64()?,
                    low: r.candle.mid.low.to_f64()?,
                    close: r.candle.mid.close.to_f64()?,
                })
            })
            .collect();

        let bands = bollinger(&closes, 20, 2.0);
        let metric = VolatilityRow {
            instrument: instrument.clone(),
            asset_class: instrument.asset_class(),
            time: latest.time,
            hv20: historical_volatility(&closes, 20).and_then(VolatilityRow::hv_metric),
            hv50: historical_volatility(&closes, 50).and_then(VolatilityRow::hv_metric),
            sma15: sma(&closes, 15).and_then(VolatilityRow::price_metric),
            sma30: sma(&closes, 30).and_then(VolatilityRow::price_metric),
            sma50: sma(&closes, 50).and_then(VolatilityRow::price_metric),
            bb_upper: bands.and_then(|b| VolatilityRow::price_metric(b.upper)),
            bb_middle: bands.and_then(|b| VolatilityRow::price_metric(b.middle)),
            bb_lower: bands.and_then(|b| VolatilityRow::price_metric(b.lower)),
            atr: atr(&bars, 14).and_then(VolatilityRow::price_metric),
        };

        // ── 5. Persist metrics ──────────────────────────────────────────
        if !metric.is_empty() {
            self.store.upsert_volatility(std::slice::from_ref(&metric)).await?;
        } else {
            debug!(instrument = %instrument, samples = closes.len(), "window too short for metrics");
        }

        // ── 6. Cache ────────────────────────────────────────────────────
        let point = PricePoint {
            bid: latest.bid.close,
            ask: latest.ask.close,
            mid: latest.mid.close,
            time: latest.time,
        };
        let price_key = Cache::price_key(instrument);
        let previous_mid = self
            .cache
            .get(&price_key)
            .and_then(|v| v.get("mid").cloned());

        let point_json = serde_json::to_value(&point)?;
        self.cache
            .put(&price_key, point_json.clone(), self.cache.ttls().prices);

        if !metric.is_empty() {
            let metrics_json = serde_json::json!({
                "instrument": instrument,
                "asset_class": metric.asset_class,
                "time": metric.time,
                "hv20": metric.hv20,
                "hv50": metric.hv50,
                "sma15": metric.sma15,
                "sma30": metric.sma30,
                "sma50": metric.sma50,
                "bb_upper": metric.bb_upper,
                "bb_middle": metric.bb_middle,
                "bb_lower": metric.bb_lower,
                "atr": metric.atr,
            });
            self.cache.put(
                &Cache::metrics_key(instrument),
                metrics_json,
                self.cache.ttls().metrics,
            );
        }

        // ── 7. Publish ──────────────────────────────────────────────────
        let close_changed = previous_mid.as_ref() != point_json.get("mid");
        if close_changed {
            let update = BusMessage::Price(PriceUpdate {
                instrument: instrument.clone(),
                price: point,
                timestamp: logical_now,
            });
            if let Err(e) = self.cache.bus().publish(update) {
                warn!(instrument = %instrument, error = %e, "price publish failed (continuing)");
            }
        }

        if let Some(hv20) = metric.hv20.as_ref().and_then(|d| d.to_f64()) {
            if hv20 > self.volatility_threshold {
                let severity = volatility_severity(hv20, self.volatility_threshold);
                let alert = BusMessage::Volatility(VolatilityAlert {
                    instrument: instrument.clone(),
                    volatility: hv20,
                    threshold: self.volatility_threshold,
                    severity,
                    message: format!(
                        "{instrument} hv20 at {hv20:.2}% exceeds {:.2}%",
                        self.volatility_threshold
                    ),
                    timestamp: logical_now,
                });
                if let Err(e) = self.cache.bus().publish(alert) {
                    warn!(instrument = %instrument, error = %e, "volatility alert publish failed (continuing)");
                }
            }
        }

        Ok(close_changed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerCandle, Ohlc};
    use crate::cache::Channel;
    use crate::config::CacheTtls;
    use crate::store::test_store;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::time::Duration;

    fn inst(s: &str) -> Instrument {
        Instrument::new(s).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn test_cache() -> Arc<Cache> {
        Arc::new(Cache::new(CacheTtls {
            prices: Duration::from_secs(300),
            metrics: Duration::from_secs(3600),
            correlation: Duration::from_secs(86_400),
        }))
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h % 24, 0, 0).unwrap() + chrono::Duration::days(i64::from(h / 24))
    }

    fn flat_candle(t: DateTime<Utc>, mid: &str) -> BrokerCandle {
        let m = dec(mid);
        let spread = dec("0.00010");
        let side = |px: Decimal| Ohlc {
            open: px,
            high: px,
            low: px,
            close: px,
        };
        BrokerCandle {
            time: t,
            complete: true,
            bid: Some(side(m - spread)),
            ask: Some(side(m + spread)),
            mid: Some(side(m)),
            volume: 100,
        }
    }

    /// Stub broker: canned responses per instrument, or an error.
    struct StubBroker {
        responses: Mutex<HashMap<Instrument, Result<Vec<BrokerCandle>, String>>>,
        auth_fail: bool,
    }

    impl StubBroker {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                auth_fail: false,
            }
        }

        fn with(self, instrument: &str, candles: Vec<BrokerCandle>) -> Self {
            self.responses
                .lock()
                .insert(inst(instrument), Ok(candles));
            self
        }

        fn failing(self, instrument: &str) -> Self {
            self.responses
                .lock()
                .insert(inst(instrument), Err("server error".into()));
            self
        }
    }

    #[async_trait]
    impl CandleSource for StubBroker {
        async fn fetch_candles(
            &self,
            instrument: &Instrument,
            _granularity: Granularity,
            _count: u32,
            _sides: PriceSides,
        ) -> Result<Vec<BrokerCandle>, BrokerError> {
            if self.auth_fail {
                return Err(BrokerError::Auth { status: 401 });
            }
            match self.responses.lock().get(instrument) {
                Some(Ok(candles)) => Ok(candles.clone()),
                Some(Err(msg)) => Err(BrokerError::Unavailable(msg.clone())),
                None => Ok(vec![]),
            }
        }
    }

    fn job(broker: StubBroker, store: &Store, cache: &Arc<Cache>, universe: &[&str]) -> HourlyJob {
        HourlyJob::new(
            Arc::new(broker),
            store.clone(),
            cache.clone(),
            universe.iter().map(|s| inst(s)).collect(),
            2.0,
            1, // deterministic in tests
        )
    }

    #[tokio::test]
    async fn rerun_with_identical_data_converges() {
        let store = test_store().await;
        let cache = test_cache();
        let candles = vec![flat_candle(hour(9), "1.10000"), flat_candle(hour(10), "1.10050")];
        let j = job(
            StubBroker::new().with("EUR_USD", candles),
            &store,
            &cache,
            &["EUR_USD"],
        );

        j.run(hour(10)).await.unwrap();
        let first = store
            .get_recent_candles(&inst("EUR_USD"), Granularity::H1, 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        j.run(hour(10)).await.unwrap();
        let second = store
            .get_recent_candles(&inst("EUR_USD"), Granularity::H1, 10)
            .await
            .unwrap();

        // Exactly one row per (instrument, time, granularity), and
        // updated_at never moves backwards.
        assert_eq!(second.len(), 2);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.candle.time, b.candle.time);
            assert_eq!(a.candle.mid.close, b.candle.mid.close);
            assert!(b.updated_at >= a.updated_at);
        }
    }

    #[tokio::test]
    async fn publishes_price_and_data_ready() {
        let store = test_store().await;
        let cache = test_cache();
        let mut price_rx = cache.bus().subscribe(Channel::PriceUpdates);
        let mut ready_rx = cache.bus().subscribe(Channel::DataReady);

        let j = job(
            StubBroker::new().with("EUR_USD", vec![flat_candle(hour(9), "1.10000")]),
            &store,
            &cache,
            &["EUR_USD"],
        );
        let report = j.run(hour(9)).await.unwrap();
        assert_eq!(report.records_processed, 1);
        assert!(report.note.is_none());

        let BusMessage::Price(update) = price_rx.try_recv().unwrap() else {
            panic!()
        };
        assert_eq!(update.instrument.as_str(), "EUR_USD");
        assert_eq!(update.price.mid, dec("1.10000"));

        let BusMessage::DataReady(ready) = ready_rx.try_recv().unwrap() else {
            panic!()
        };
        assert_eq!(ready.data_type, DataType::Prices);
        assert_eq!(ready.count, 1);

        // Cache carries the latest price.
        let cached = cache.get("prices:EUR_USD").unwrap();
        assert_eq!(cached["mid"], serde_json::json!("1.10000"));
    }

    #[tokio::test]
    async fn unchanged_close_publishes_no_price_update() {
        let store = test_store().await;
        let cache = test_cache();
        let j = job(
            StubBroker::new().with("EUR_USD", vec![flat_candle(hour(9), "1.10000")]),
            &store,
            &cache,
            &["EUR_USD"],
        );

        j.run(hour(9)).await.unwrap();
        let mut price_rx = cache.bus().subscribe(Channel::PriceUpdates);
        j.run(hour(9)).await.unwrap();

        // Same close as the cached value: nothing new on the channel.
        assert!(price_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn volatility_alert_fires_above_threshold() {
        let store = test_store().await;
        let cache = test_cache();

        // Seed a volatile stored history: alternating closes swing hard
        // enough that hv20 dwarfs the 2.0% threshold.
        let history: Vec<StoredCandle> = (0..30)
            .map(|h| {
                let mid = if h % 2 == 0 { "1.10000" } else { "1.12000" };
                StoredCandle::from_broker(
                    &inst("GBP_JPY"),
                    Granularity::H1,
                    &flat_candle(hour(h), mid),
                )
                .unwrap()
            })
            .collect();
        store.upsert_candles(&history).await.unwrap();

        let mut alert_rx = cache.bus().subscribe(Channel::VolatilityAlerts);
        let j = job(
            StubBroker::new().with("GBP_JPY", vec![flat_candle(hour(30), "1.10000")]),
            &store,
            &cache,
            &["GBP_JPY"],
        );
        j.run(hour(30)).await.unwrap();

        let BusMessage::Volatility(alert) = alert_rx.try_recv().unwrap() else {
            panic!()
        };
        assert_eq!(alert.instrument.as_str(), "GBP_JPY");
        assert!(alert.volatility > alert.threshold);
        assert!(alert.severity >= crate::types::Severity::Warning);

        // Derived metrics landed in store and cache.
        let metric = store
            .get_latest_volatility(&inst("GBP_JPY"))
            .await
            .unwrap()
            .unwrap();
        assert!(metric.hv20.is_some());
        assert!(cache.get("metrics:GBP_JPY").is_some());
    }

    #[tokio::test]
    async fn tolerated_failures_note_partial_coverage() {
        let store = test_store().await;
        let cache = test_cache();
        let j = job(
            StubBroker::new()
                .with("EUR_USD", vec![flat_candle(hour(9), "1.10000")])
                .with("GBP_USD", vec![flat_candle(hour(9), "1.30000")])
                .with("USD_JPY", vec![flat_candle(hour(9), "150.00000")])
                .failing("AUD_USD"),
            &store,
            &cache,
            &["EUR_USD", "GBP_USD", "USD_JPY", "AUD_USD"],
        );

        // 1 of 4 failed (25% <= 30%): success with a note.
        let report = j.run(hour(9)).await.unwrap();
        assert!(report.note.unwrap().contains("AUD_USD"));
    }

    #[tokio::test]
    async fn excessive_failures_fail_the_run() {
        let store = test_store().await;
        let cache = test_cache();
        let j = job(
            StubBroker::new()
                .with("EUR_USD", vec![flat_candle(hour(9), "1.10000")])
                .failing("GBP_USD"),
            &store,
            &cache,
            &["EUR_USD", "GBP_USD"],
        );

        // 1 of 2 failed (50% > 30%): the run is failed.
        assert!(j.run(hour(9)).await.is_err());
    }

    #[tokio::test]
    async fn auth_rejection_fails_immediately() {
        let store = test_store().await;
        let cache = test_cache();
        let mut broker = StubBroker::new();
        broker.auth_fail = true;
        let j = job(broker, &store, &cache, &["EUR_USD"]);

        let err = j.run(hour(9)).await.unwrap_err();
        assert!(err.to_string().contains("credentials"));
    }

    #[tokio::test]
    async fn incomplete_candles_are_not_persisted() {
        let store = test_store().await;
        let cache = test_cache();
        let mut forming = flat_candle(hour(10), "1.10100");
        forming.complete = false;
        let j = job(
            StubBroker::new().with(
                "EUR_USD",
                vec![flat_candle(hour(9), "1.10000"), forming],
            ),
            &store,
            &cache,
            &["EUR_USD"],
        );
        j.run(hour(10)).await.unwrap();

        let rows = store
            .get_recent_candles(&inst("EUR_USD"), Granularity::H1, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].candle.time, hour(9));
    }
}

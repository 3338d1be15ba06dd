// =============================================================================
// Daily Correlation Job — pairwise matrix + best-pairs ranking
// =============================================================================
//
// Over the FX + metal universe: load each instrument's recent H1 mid closes,
// inner-join every unordered pair on candle time, compute Pearson rho over
// the shared window, persist the matrix and a ranked best-pairs snapshot,
// refresh the cache, and publish correlation alerts for strong pairs. Pairs
// without enough shared history are skipped and counted, never guessed.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info, warn};

use crate::analytics::best_pairs::{classify_and_rank, PairCategory};
use crate::analytics::correlation::{pair_correlation, ClosePoint};
use crate::cache::{BusMessage, Cache, CorrelationAlert, DataReady, DataType, CORRELATION_MATRIX_KEY};
use crate::jobs::{correlation_severity, JobReport};
use crate::store::{CorrelationRow, Store};
use crate::types::{Granularity, Instrument};

pub const DAILY_JOB_NAME: &str = "daily_correlation";

/// Shared-sample window for pairwise correlation.
const DEFAULT_WINDOW: usize = 100;

pub struct DailyCorrelationJob {
    store: Store,
    cache: Arc<Cache>,
    /// FX + metal instruments only; CFDs never enter the matrix.
    universe: Vec<Instrument>,
    correlation_threshold: f64,
    window: usize,
}

impl DailyCorrelationJob {
    pub fn new(
        store: Store,
        cache: Arc<Cache>,
        universe: Vec<Instrument>,
        correlation_threshold: f64,
    ) -> Self {
        let mut universe: Vec<Instrument> = universe
            .into_iter()
            .filter(|i| i.asset_class().correlates())
            .collect();
        // Sorted so pair enumeration is canonical (pair1 < pair2) for free.
        universe.sort();
        universe.dedup();

        Self {
            store,
            cache,
            universe,
            correlation_threshold,
            window: DEFAULT_WINDOW,
        }
    }

    #[cfg(test)]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Execute one run. `logical_now` tags every row and message of this
    /// snapshot.
    pub async fn run(&self, logical_now: DateTime<Utc>) -> Result<JobReport> {
        info!(at = %logical_now, instruments = self.universe.len(), "daily correlation starting");

        // ── 1. Load close series ────────────────────────────────────────
        let mut series: HashMap<Instrument, Vec<ClosePoint>> = HashMap::new();
        for instrument in &self.universe {
            let closes = self
                .store
                .get_recent_closes(instrument, Granularity::H1, self.window as u32)
                .await?;
            let points: Vec<ClosePoint> = closes
                .into_iter()
                .filter_map(|(t, d)| Some((t, d.to_f64()?)))
                .collect();
            debug!(instrument = %instrument, samples = points.len(), "close series loaded");
            series.insert(instrument.clone(), points);
        }

        // ── 2+3. Align and correlate every unordered pair ───────────────
        let mut entries: Vec<CorrelationRow> = Vec::new();
        let mut skipped: u64 = 0;
        for (idx, a) in self.universe.iter().enumerate() {
            for b in self.universe.iter().skip(idx + 1) {
                match pair_correlation(&series[a], &series[b], self.window) {
                    Ok(rho) => entries.push(CorrelationRow::canonical(
                        a.clone(),
                        b.clone(),
                        logical_now,
                        rho,
                        self.window as i64,
                    )),
                    Err(gap) => {
                        skipped += 1;
                        info!(pair1 = %a, pair2 = %b, reason = %gap, "pair skipped, missing coverage");
                    }
                }
            }
        }

        // ── 4. Persist the matrix ───────────────────────────────────────
        self.store.insert_correlation(&entries).await?;

        // ── 5. Classify, rank, append snapshot ──────────────────────────
        let tuples: Vec<(Instrument, Instrument, f64)> = entries
            .iter()
            .map(|e| (e.pair1.clone(), e.pair2.clone(), e.correlation))
            .collect();
        let ranked = classify_and_rank(&tuples, self.correlation_threshold);
        self.store.append_best_pairs(&logical_now, &ranked).await?;

        // ── 6. Cache ────────────────────────────────────────────────────
        let matrix_json = serde_json::json!({
            "time": logical_now,
            "window_size": self.window,
            "instruments": self.universe,
            "entries": entries.iter().map(|e| serde_json::json!({
                "pair1": e.pair1,
                "pair2": e.pair2,
                "correlation": e.correlation,
            })).collect::<Vec<_>>(),
        });
        let ttl = self.cache.ttls().correlation;
        self.cache.put(CORRELATION_MATRIX_KEY, matrix_json, ttl);

        for category in PairCategory::ALL {
            let members: Vec<&_> = ranked.iter().filter(|r| r.category == category).collect();
            self.cache.put(
                &Cache::best_pairs_key(category.as_str()),
                serde_json::to_value(&members)?,
                ttl,
            );
        }
        self.cache
            .put(&Cache::best_pairs_key("all"), serde_json::to_value(&ranked)?, ttl);

        // ── 7. Alerts for strong pairs ──────────────────────────────────
        for entry in &entries {
            if entry.correlation.abs() >= self.correlation_threshold {
                let severity = correlation_severity(entry.correlation);
                let direction = if entry.correlation < 0.0 { "inverse" } else { "direct" };
                let alert = BusMessage::Correlation(CorrelationAlert {
                    pair1: entry.pair1.clone(),
                    pair2: entry.pair2.clone(),
                    correlation: entry.correlation,
                    threshold: self.correlation_threshold,
                    severity,
                    message: format!(
                        "{} and {} show strong {direction} correlation (rho {:.3})",
                        entry.pair1, entry.pair2, entry.correlation
                    ),
                    timestamp: logical_now,
                });
                if let Err(e) = self.cache.bus().publish(alert) {
                    warn!(error = %e, "correlation alert publish failed (continuing)");
                }
            }
        }

        // ── 8. Summary ──────────────────────────────────────────────────
        let ready = BusMessage::DataReady(DataReady {
            data_type: DataType::Correlations,
            count: entries.len() as u64,
            timestamp: logical_now,
            message: (skipped > 0).then(|| format!("{skipped} pairs skipped, missing coverage")),
        });
        if let Err(e) = self.cache.bus().publish(ready) {
            warn!(error = %e, "data_ready publish failed (continuing)");
        }

        info!(
            entries = entries.len(),
            best_pairs = ranked.len(),
            skipped,
            "daily correlation finished"
        );
        Ok(JobReport {
            records_processed: entries.len() as i64,
            note: (skipped > 0).then(|| format!("{skipped} pairs skipped, missing coverage")),
        })
    }
}

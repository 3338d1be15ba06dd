// =============================================================================
// Hot Cache — TTL-bounded view of the latest computed values
// =============================================================================
//
// A typed key-value map with class-specific TTLs plus the publish/subscribe
// bus (see `bus.rs`). Entries expire silently: a `get` past the deadline is
// a miss, not an error, and lazily evicts the entry. The cache lifecycle is
// fully independent of the durable store.
//
// Key classes:
//   prices:<instrument>      latest {bid, ask, mid, time}        (300 s)
//   metrics:<instrument>     latest volatility metric set        (3600 s)
//   correlation:matrix       latest serialized matrix            (86400 s)
//   best_pairs:<category>    latest snapshot (plus :all)         (86400 s)

pub mod bus;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::config::CacheTtls;
use crate::types::Instrument;

pub use bus::{
    Bus, BusMessage, Channel, CorrelationAlert, DataReady, DataType, PricePoint, PriceUpdate,
    VolatilityAlert,
};

pub const CORRELATION_MATRIX_KEY: &str = "correlation:matrix";

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-process cache shared between the jobs (writers) and the fan-out
/// server (reader). Connection-safe by construction; clone the `Arc`.
pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
    bus: Bus,
    ttls: CacheTtls,
}

impl Cache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus: Bus::new(),
            ttls,
        }
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    // ── Key helpers ─────────────────────────────────────────────────────

    pub fn price_key(instrument: &Instrument) -> String {
        format!("prices:{instrument}")
    }

    pub fn metrics_key(instrument: &Instrument) -> String {
        format!("metrics:{instrument}")
    }

    pub fn best_pairs_key(category: &str) -> String {
        format!("best_pairs:{category}")
    }

    // ── Core operations ─────────────────────────────────────────────────

    /// Store `value` under `key`. Overwrites; the TTL restarts on every
    /// write.
    pub fn put(&self, key: &str, value: Value, ttl: Duration) {
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch the live value under `key`. A miss (absent or expired) returns
    /// `None`; expired entries are evicted on the way out.
    pub fn get(&self, key: &str) -> Option<Value> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone())
                }
                Some(_) => {} // expired: fall through to evict
                None => return None,
            }
        }
        let mut entries = self.entries.write();
        if entries
            .get(key)
            .is_some_and(|e| e.expires_at <= Instant::now())
        {
            entries.remove(key);
            debug!(key, "expired cache entry evicted");
        }
        None
    }

    /// All live `prices:*` values, sorted by key for deterministic replies.
    pub fn all_prices(&self) -> Vec<(String, Value)> {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut out: Vec<(String, Value)> = entries
            .iter()
            .filter(|(k, e)| k.starts_with("prices:") && e.expires_at > now)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Drop every expired entry; returns how many were removed. Called from
    /// a periodic sweeper so untouched keys do not pile up.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Number of live entries (diagnostic).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ttls() -> CacheTtls {
        CacheTtls {
            prices: Duration::from_secs(300),
            metrics: Duration::from_secs(3600),
            correlation: Duration::from_secs(86_400),
        }
    }

    fn inst(s: &str) -> Instrument {
        Instrument::new(s).unwrap()
    }

    #[test]
    fn put_then_get() {
        let cache = Cache::new(ttls());
        cache.put("prices:EUR_USD", json!({"mid": "1.1"}), Duration::from_secs(60));
        assert_eq!(
            cache.get("prices:EUR_USD").unwrap()["mid"],
            json!("1.1")
        );
        assert!(cache.get("prices:GBP_USD").is_none());
    }

    #[test]
    fn entries_expire_silently() {
        let cache = Cache::new(ttls());
        cache.put("k", json!(1), Duration::from_millis(20));
        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("k").is_none()); // a miss, not an error
        assert!(cache.is_empty());
    }

    #[test]
    fn ttl_resets_on_overwrite() {
        let cache = Cache::new(ttls());
        cache.put("k", json!(1), Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(20));
        cache.put("k", json!(2), Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(20));
        // 40 ms after the first write but only 20 ms after the second.
        assert_eq!(cache.get("k").unwrap(), json!(2));
    }

    #[test]
    fn all_prices_filters_by_prefix_and_liveness() {
        let cache = Cache::new(ttls());
        cache.put(
            &Cache::price_key(&inst("EUR_USD")),
            json!({"mid": "1.1"}),
            Duration::from_secs(60),
        );
        cache.put(
            &Cache::price_key(&inst("GBP_USD")),
            json!({"mid": "1.3"}),
            Duration::from_millis(1),
        );
        cache.put(
            &Cache::metrics_key(&inst("EUR_USD")),
            json!({"hv20": "2.0"}),
            Duration::from_secs(60),
        );
        std::thread::sleep(Duration::from_millis(10));

        let prices = cache.all_prices();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].0, "prices:EUR_USD");
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = Cache::new(ttls());
        cache.put("a", json!(1), Duration::from_millis(1));
        cache.put("b", json!(2), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn key_helpers() {
        assert_eq!(Cache::price_key(&inst("EUR_USD")), "prices:EUR_USD");
        assert_eq!(Cache::metrics_key(&inst("GBP_JPY")), "metrics:GBP_JPY");
        assert_eq!(Cache::best_pairs_key("hedging"), "best_pairs:hedging");
        assert_eq!(Cache::best_pairs_key("all"), "best_pairs:all");
    }
}

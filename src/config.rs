// =============================================================================
// Engine Configuration — environment-sourced, validated at startup
// =============================================================================
//
// Every tunable lives here. `Config::from_env()` is called once in main();
// a missing required option or an unparseable value halts startup with a
// diagnostic (process exit code 1). The broker token is the only secret and
// is excluded from the Debug impl.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::types::Instrument;

/// Default tracked universe when `TRACKED_PAIRS` is unset: the major FX
/// crosses plus spot gold and silver.
const DEFAULT_PAIRS: &str = "EUR_USD,GBP_USD,USD_JPY,USD_CHF,AUD_USD,USD_CAD,\
                             NZD_USD,EUR_GBP,EUR_JPY,GBP_JPY,EUR_CHF,AUD_JPY,\
                             XAU_USD,XAG_USD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which broker environment to target. Selects the REST base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEnv {
    Practice,
    Live,
}

impl BrokerEnv {
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Practice => "https://api-fxpractice.oanda.com",
            Self::Live => "https://api-fxtrade.oanda.com",
        }
    }
}

impl std::fmt::Display for BrokerEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Practice => write!(f, "practice"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Per-class cache TTLs.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub prices: Duration,
    pub metrics: Duration,
    pub correlation: Duration,
}

/// Validated engine configuration.
#[derive(Clone)]
pub struct Config {
    /// Bearer token for broker requests. Required; never logged.
    pub broker_token: String,
    pub broker_env: BrokerEnv,

    /// Ordered tracked universe (FX + metals + CFDs).
    pub tracked_pairs: Vec<Instrument>,

    /// |ρ| at which correlation alerts fire and pairs classify as highly
    /// correlated.
    pub correlation_threshold: f64,
    /// hv20 level (percent) above which volatility alerts fire.
    pub volatility_threshold: f64,

    pub cache_ttls: CacheTtls,

    /// Token-bucket sizing for outbound broker calls.
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    pub fanout_bind_addr: String,
    pub fanout_max_clients: usize,
    pub fanout_ping_interval: Duration,
    pub fanout_ping_timeout: Duration,
    /// Dropped-relay count after which a session is closed as a slow consumer.
    pub fanout_max_drops: u64,

    pub job_hourly_enabled: bool,
    pub job_daily_enabled: bool,
    /// Concurrent broker fetches inside a job run. Tests pin this to 1.
    pub job_concurrency: usize,

    /// Advisory retention horizon; the engine never deletes inside it.
    pub data_retention_days: u32,

    pub store_dsn: String,
}

impl Config {
    /// Read and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker_token = match std::env::var("BROKER_TOKEN") {
            Ok(t) if !t.trim().is_empty() => t,
            _ => return Err(ConfigError::Missing("BROKER_TOKEN")),
        };

        let broker_env = match env_or("BROKER_ENV", "practice").as_str() {
            "practice" => BrokerEnv::Practice,
            "live" => BrokerEnv::Live,
            other => {
                return Err(ConfigError::Invalid {
                    key: "BROKER_ENV",
                    value: other.to_string(),
                    reason: "expected 'practice' or 'live'".into(),
                })
            }
        };

        let raw_pairs = env_or("TRACKED_PAIRS", DEFAULT_PAIRS);
        let mut tracked_pairs = Vec::new();
        for token in raw_pairs.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let inst = Instrument::new(token).ok_or_else(|| ConfigError::Invalid {
                key: "TRACKED_PAIRS",
                value: token.to_string(),
                reason: "not a valid instrument identifier".into(),
            })?;
            if !tracked_pairs.contains(&inst) {
                tracked_pairs.push(inst);
            }
        }
        if tracked_pairs.is_empty() {
            return Err(ConfigError::Invalid {
                key: "TRACKED_PAIRS",
                value: raw_pairs,
                reason: "universe is empty".into(),
            });
        }

        // The cache and bus live in-process; a configured cache address is
        // accepted so deployment manifests keep working, but unused. The
        // value is not logged (connection strings may embed credentials).
        if std::env::var("CACHE_ADDR").is_ok_and(|v| !v.trim().is_empty()) {
            tracing::info!("CACHE_ADDR set; cache and bus are in-process, option ignored");
        }

        let correlation_threshold = parse_env("CORRELATION_THRESHOLD", 0.7_f64)?;
        if !(0.0..=1.0).contains(&correlation_threshold) {
            return Err(ConfigError::Invalid {
                key: "CORRELATION_THRESHOLD",
                value: correlation_threshold.to_string(),
                reason: "must lie in [0, 1]".into(),
            });
        }

        Ok(Self {
            broker_token,
            broker_env,
            tracked_pairs,
            correlation_threshold,
            volatility_threshold: parse_env("VOLATILITY_THRESHOLD", 2.0_f64)?,
            cache_ttls: CacheTtls {
                prices: Duration::from_secs(parse_env("CACHE_TTL_PRICES", 300_u64)?),
                metrics: Duration::from_secs(parse_env("CACHE_TTL_METRICS", 3600_u64)?),
                correlation: Duration::from_secs(parse_env("CACHE_TTL_CORRELATION", 86_400_u64)?),
            },
            rate_limit_requests: parse_env("RATE_LIMIT_REQUESTS", 100_u32)?,
            rate_limit_window: Duration::from_secs(parse_env("RATE_LIMIT_WINDOW", 60_u64)?),
            fanout_bind_addr: env_or("FANOUT_BIND_ADDR", "0.0.0.0:8765"),
            fanout_max_clients: parse_env("FANOUT_MAX_CLIENTS", 1000_usize)?,
            fanout_ping_interval: Duration::from_secs(parse_env("FANOUT_PING_INTERVAL", 25_u64)?),
            fanout_ping_timeout: Duration::from_secs(parse_env("FANOUT_PING_TIMEOUT", 5_u64)?),
            fanout_max_drops: parse_env("FANOUT_MAX_DROPS", 50_u64)?,
            job_hourly_enabled: parse_env("JOB_HOURLY_ENABLED", true)?,
            job_daily_enabled: parse_env("JOB_DAILY_ENABLED", true)?,
            job_concurrency: parse_env("JOB_CONCURRENCY", 8_usize)?.max(1),
            data_retention_days: parse_env("DATA_RETENTION_DAYS", 365_u32)?,
            store_dsn: env_or("STORE_DSN", "sqlite://meridian.db?mode=rwc"),
        })
    }

    /// Tracked instruments eligible for the correlation matrix (FX + metals).
    pub fn correlation_universe(&self) -> Vec<Instrument> {
        self.tracked_pairs
            .iter()
            .filter(|i| i.asset_class().correlates())
            .cloned()
            .collect()
    }

    pub fn is_tracked(&self, instrument: &Instrument) -> bool {
        self.tracked_pairs.contains(instrument)
    }
}

// The token must never leak through Debug-formatted logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("broker_token", &"<redacted>")
            .field("broker_env", &self.broker_env)
            .field("tracked_pairs", &self.tracked_pairs.len())
            .field("correlation_threshold", &self.correlation_threshold)
            .field("volatility_threshold", &self.volatility_threshold)
            .field("fanout_bind_addr", &self.fanout_bind_addr)
            .field("fanout_max_clients", &self.fanout_max_clients)
            .field("store_dsn", &self.store_dsn)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Env helpers
// =============================================================================

fn env_or(key: &'static str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => {
            v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: v,
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

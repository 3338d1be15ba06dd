// =============================================================================
// Broker REST API Client — Bearer-authenticated candle fetches
// =============================================================================
//
// SECURITY: the access token is installed once as a default header and never
// logged or serialized; the Debug impl redacts it.
//
// The broker returns OHLC fields as decimal strings. They are parsed into
// `rust_decimal::Decimal` before anything else touches them; binary floats
// never see a raw price.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::broker::rate_limit::TokenBucket;
use crate::config::BrokerEnv;
use crate::error::BrokerError;
use crate::types::{Granularity, Instrument};

/// Hard upper bound on candles per request, imposed by the upstream API.
const MAX_COUNT: u32 = 5000;
/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum attempts per fetch (first try + retries).
const MAX_ATTEMPTS: u32 = 5;
/// Exponential backoff base and ceiling.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

// =============================================================================
// Wire types
// =============================================================================

/// Which quote sides to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceSides {
    pub bid: bool,
    pub ask: bool,
    pub mid: bool,
}

impl PriceSides {
    pub const ALL: PriceSides = PriceSides {
        bid: true,
        ask: true,
        mid: true,
    };

    /// Query-parameter encoding, e.g. `MBA` for all three sides.
    pub fn query_code(&self) -> String {
        let mut code = String::with_capacity(3);
        if self.mid {
            code.push('M');
        }
        if self.bid {
            code.push('B');
        }
        if self.ask {
            code.push('A');
        }
        code
    }
}

/// One quote side's open/high/low/close, parsed to decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Ohlc {
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
}

/// A candle as returned by the broker. `complete == false` marks the bucket
/// still forming; callers decide whether to keep it.
#[derive(Debug, Clone)]
pub struct BrokerCandle {
    pub time: DateTime<Utc>,
    pub complete: bool,
    pub bid: Option<Ohlc>,
    pub ask: Option<Ohlc>,
    pub mid: Option<Ohlc>,
    pub volume: i64,
}

#[derive(Deserialize)]
struct RawResponse {
    candles: Vec<RawCandle>,
}

#[derive(Deserialize)]
struct RawCandle {
    time: String,
    complete: bool,
    #[serde(default)]
    bid: Option<Ohlc>,
    #[serde(default)]
    ask: Option<Ohlc>,
    #[serde(default)]
    mid: Option<Ohlc>,
    #[serde(default)]
    volume: i64,
}

// =============================================================================
// CandleSource seam
// =============================================================================

/// The contract jobs depend on; tests substitute a stub implementation.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(
        &self,
        instrument: &Instrument,
        granularity: Granularity,
        count: u32,
        sides: PriceSides,
    ) -> Result<Vec<BrokerCandle>, BrokerError>;
}

// =============================================================================
// Client
// =============================================================================

/// REST client for the broker's candle endpoint.
#[derive(Clone)]
pub struct BrokerClient {
    base_url: String,
    http: reqwest::Client,
    limiter: Arc<TokenBucket>,
}

impl BrokerClient {
    /// Build a client for the given environment. The token is moved into the
    /// default Authorization header and not retained anywhere readable.
    pub fn new(token: &str, env: BrokerEnv, limiter: Arc<TokenBucket>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        debug!(env = %env, "broker client initialised");

        Self {
            base_url: env.base_url().to_string(),
            http,
            limiter,
        }
    }

    /// Override the base URL (tests point this at a local stub).
    #[cfg(test)]
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = base.into();
        self
    }

    async fn fetch_once(
        &self,
        instrument: &Instrument,
        granularity: Granularity,
        count: u32,
        sides: PriceSides,
    ) -> Result<Vec<BrokerCandle>, BrokerError> {
        let url = format!(
            "{}/v3/instruments/{}/candles?count={}&granularity={}&price={}",
            self.base_url,
            instrument,
            count,
            granularity,
            sides.query_code()
        );

        self.limiter.acquire().await;

        let resp = self.http.get(&url).send().await.map_err(map_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("body read failed: {e}")))?;
        parse_candles(&body)
    }
}

#[async_trait]
impl CandleSource for BrokerClient {
    /// Fetch up to `count` candles, retrying transient failures with
    /// exponential backoff (base 1 s, cap 60 s). Auth and bad-request
    /// failures surface immediately.
    async fn fetch_candles(
        &self,
        instrument: &Instrument,
        granularity: Granularity,
        count: u32,
        sides: PriceSides,
    ) -> Result<Vec<BrokerCandle>, BrokerError> {
        if count == 0 || count > MAX_COUNT {
            return Err(BrokerError::BadRequest(format!(
                "count must be in 1..={MAX_COUNT}, got {count}"
            )));
        }
        if sides.query_code().is_empty() {
            return Err(BrokerError::BadRequest(
                "at least one price side must be requested".into(),
            ));
        }

        let mut attempt = 1;
        loop {
            match self.fetch_once(instrument, granularity, count, sides).await {
                Ok(candles) => {
                    debug!(
                        instrument = %instrument,
                        granularity = %granularity,
                        count = candles.len(),
                        "candles fetched"
                    );
                    return Ok(candles);
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = retry_delay(attempt, &e);
                    warn!(
                        instrument = %instrument,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Response handling helpers
// =============================================================================

fn map_transport(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Unavailable("request timed out".into())
    } else {
        BrokerError::Unavailable(e.to_string())
    }
}

/// Map a non-success HTTP status onto the error kind that drives retry
/// policy.
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> BrokerError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BrokerError::Auth {
            status: status.as_u16(),
        },
        StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited { retry_after },
        s if s.is_server_error() => {
            BrokerError::Unavailable(format!("status {s}: {}", truncate(body)))
        }
        s => BrokerError::BadRequest(format!("status {s}: {}", truncate(body))),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Backoff for the given 1-based attempt, honouring a server hint when it
/// exceeds our own schedule.
fn retry_delay(attempt: u32, error: &BrokerError) -> Duration {
    let exp = BACKOFF_BASE * 2_u32.pow(attempt.saturating_sub(1));
    let backoff = exp.min(BACKOFF_CAP);
    match error {
        BrokerError::RateLimited {
            retry_after: Some(hint),
        } => (*hint).max(backoff).min(BACKOFF_CAP),
        _ => backoff,
    }
}

/// Parse a candle-batch response body.
pub fn parse_candles(body: &str) -> Result<Vec<BrokerCandle>, BrokerError> {
    let raw: RawResponse =
        serde_json::from_str(body).map_err(|e| BrokerError::Parse(e.to_string()))?;

    let mut out = Vec::with_capacity(raw.candles.len());
    for c in raw.candles {
        let time = DateTime::parse_from_rfc3339(&c.time)
            .map_err(|e| BrokerError::Parse(format!("bad candle time {:?}: {e}", c.time)))?
            .with_timezone(&Utc);

        if c.bid.is_none() && c.ask.is_none() && c.mid.is_none() {
            return Err(BrokerError::Parse(format!(
                "candle at {time} carries no price side"
            )));
        }
        if c.volume < 0 {
            return Err(BrokerError::Parse(format!(
                "candle at {time} has negative volume {}",
                c.volume
            )));
        }

        out.push(BrokerCandle {
            time,
            complete: c.complete,
            bid: c.bid,
            ask: c.ask,
            mid: c.mid,
            volume: c.volume,
        });
    }
    Ok(out)
}

fn truncate(body: &str) -> &str {
    &body[..body.len().min(200)]
}

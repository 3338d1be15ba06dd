// =============================================================================
// Event Bus — in-order publish/subscribe channels
// =============================================================================
//
// Four fixed channels carry the engine's real-time traffic. Delivery is
// at-most-once with no replay: a subscriber that attaches after a publish
// has missed it, and a subscriber that falls behind the ring buffer observes
// a counted gap. Order is preserved per channel for any single subscriber;
// nothing is implied across channels.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::CacheError;
use crate::types::{Instrument, Severity};

/// Ring-buffer depth per channel. A subscriber further behind than this
/// starts losing the oldest messages (reported as a lag gap, not silently).
const CHANNEL_CAPACITY: usize = 1024;

/// The fixed channel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    PriceUpdates,
    VolatilityAlerts,
    CorrelationAlerts,
    DataReady,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PriceUpdates => "price_updates",
            Self::VolatilityAlerts => "volatility_alerts",
            Self::CorrelationAlerts => "correlation_alerts",
            Self::DataReady => "data_ready",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Message schemas
// =============================================================================

/// Latest quote snapshot for one instrument.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PricePoint {
    pub bid: Decimal,
    pub ask: Decimal,
    pub mid: Decimal,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdate {
    pub instrument: Instrument,
    pub price: PricePoint,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolatilityAlert {
    pub instrument: Instrument,
    pub volatility: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationAlert {
    pub pair1: Instrument,
    pub pair2: Instrument,
    pub correlation: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Prices,
    Metrics,
    Correlations,
    Candles,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataReady {
    pub data_type: DataType,
    pub count: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Any message the bus can carry, tagged by channel.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Price(PriceUpdate),
    Volatility(VolatilityAlert),
    Correlation(CorrelationAlert),
    DataReady(DataReady),
}

impl BusMessage {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Price(_) => Channel::PriceUpdates,
            Self::Volatility(_) => Channel::VolatilityAlerts,
            Self::Correlation(_) => Channel::CorrelationAlerts,
            Self::DataReady(_) => Channel::DataReady,
        }
    }

    /// The single instrument a message concerns, when it has one. Messages
    /// without an instrument (correlation alerts, data_ready) fan out to
    /// every session.
    pub fn instrument(&self) -> Option<&Instrument> {
        match self {
            Self::Price(m) => Some(&m.instrument),
            Self::Volatility(m) => Some(&m.instrument),
            Self::Correlation(_) | Self::DataReady(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Price(m) => serde_json::to_value(m),
            Self::Volatility(m) => serde_json::to_value(m),
            Self::Correlation(m) => serde_json::to_value(m),
            Self::DataReady(m) => serde_json::to_value(m),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Bus
// =============================================================================

/// The channel set. One sender per channel; a parked receiver per channel
/// keeps the senders alive so publishing before any subscriber attaches is
/// not an error (the message is simply unobserved).
pub struct Bus {
    price: broadcast::Sender<BusMessage>,
    volatility: broadcast::Sender<BusMessage>,
    correlation: broadcast::Sender<BusMessage>,
    data_ready: broadcast::Sender<BusMessage>,
    _parked: [broadcast::Receiver<BusMessage>; 4],
}

impl Bus {
    pub fn new() -> Self {
        let (price, pr) = broadcast::channel(CHANNEL_CAPACITY);
        let (volatility, vr) = broadcast::channel(CHANNEL_CAPACITY);
        let (correlation, cr) = broadcast::channel(CHANNEL_CAPACITY);
        let (data_ready, dr) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            price,
            volatility,
            correlation,
            data_ready,
            _parked: [pr, vr, cr, dr],
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<BusMessage> {
        match channel {
            Channel::PriceUpdates => &self.price,
            Channel::VolatilityAlerts => &self.volatility,
            Channel::CorrelationAlerts => &self.correlation,
            Channel::DataReady => &self.data_ready,
        }
    }

    /// Publish onto the message's channel. Returns the number of receivers
    /// that could observe it (the parked keep-alive included).
    pub fn publish(&self, message: BusMessage) -> Result<usize, CacheError> {
        self.sender(message.channel())
            .send(message)
            .map_err(|_| CacheError::Closed)
    }

    /// Attach a subscriber to one channel. Only messages published after
    /// this call are observed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<BusMessage> {
        self.sender(channel).subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::broadcast::error::TryRecvError;

    fn inst(s: &str) -> Instrument {
        Instrument::new(s).unwrap()
    }

    fn price_msg(instrument: &str, mid: &str) -> BusMessage {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        BusMessage::Price(PriceUpdate {
            instrument: inst(instrument),
            price: PricePoint {
                bid: mid.parse().unwrap(),
                ask: mid.parse().unwrap(),
                mid: mid.parse().unwrap(),
                time: t,
            },
            timestamp: t,
        })
    }

    #[tokio::test]
    async fn per_channel_fifo_order() {
        let bus = Bus::new();
        let mut rx = bus.subscribe(Channel::PriceUpdates);

        for i in 0..5 {
            bus.publish(price_msg("EUR_USD", &format!("1.1000{i}"))).unwrap();
        }
        for i in 0..5 {
            let msg = rx.recv().await.unwrap();
            let BusMessage::Price(p) = msg else { panic!() };
            assert_eq!(p.price.mid.to_string(), format!("1.1000{i}"));
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_publishes() {
        let bus = Bus::new();
        bus.publish(price_msg("EUR_USD", "1.10000")).unwrap();

        let mut rx = bus.subscribe(Channel::PriceUpdates);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        bus.publish(price_msg("EUR_USD", "1.10001")).unwrap();
        let BusMessage::Price(p) = rx.recv().await.unwrap() else {
            panic!()
        };
        assert_eq!(p.price.mid.to_string(), "1.10001");
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = Bus::new();
        let mut price_rx = bus.subscribe(Channel::PriceUpdates);
        let mut ready_rx = bus.subscribe(Channel::DataReady);

        bus.publish(BusMessage::DataReady(DataReady {
            data_type: DataType::Prices,
            count: 12,
            timestamp: Utc::now(),
            message: None,
        }))
        .unwrap();

        assert!(matches!(price_rx.try_recv(), Err(TryRecvError::Empty)));
        let BusMessage::DataReady(d) = ready_rx.recv().await.unwrap() else {
            panic!()
        };
        assert_eq!(d.count, 12);
        assert_eq!(d.data_type, DataType::Prices);
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = Bus::new();
        assert!(bus.publish(price_msg("EUR_USD", "1.10000")).is_ok());
    }

    #[test]
    fn message_channel_and_instrument_tagging() {
        let msg = price_msg("GBP_USD", "1.30000");
        assert_eq!(msg.channel(), Channel::PriceUpdates);
        assert_eq!(msg.instrument().unwrap().as_str(), "GBP_USD");

        let ready = BusMessage::DataReady(DataReady {
            data_type: DataType::Correlations,
            count: 3,
            timestamp: Utc::now(),
            message: None,
        });
        assert_eq!(ready.channel(), Channel::DataReady);
        assert!(ready.instrument().is_none());
    }

    #[test]
    fn data_ready_serializes_lowercase_type() {
        let json = serde_json::to_value(DataReady {
            data_type: DataType::Correlations,
            count: 3,
            timestamp: Utc::now(),
            message: None,
        })
        .unwrap();
        assert_eq!(json["data_type"], "correlations");
        assert!(json.get("message").is_none());
    }
}

// =============================================================================
// Fan-out Wire Format — {event, data} JSON envelopes
// =============================================================================
//
// Every frame in both directions is `{"event": <name>, "data": <object>}`.
// Inbound frames are parsed defensively field-by-field: clients are
// untrusted, and a malformed frame must never take the session down.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::cache::BusMessage;
use crate::types::Instrument;

// =============================================================================
// Inbound
// =============================================================================

/// `pairs` payload of subscribe/unsubscribe: explicit list or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairSelector {
    Wildcard,
    Pairs(Vec<String>),
}

/// A parsed control message from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe(PairSelector),
    Unsubscribe(PairSelector),
    GetSubscriptions,
    RequestPrice(String),
    RequestAllPrices,
    GetServerStats,
    Ping,
}

/// Parse one inbound frame. Errors describe the defect for the log; the
/// caller decides whether anything goes back to the client.
pub fn parse_client_message(text: &str) -> Result<ClientRequest, String> {
    let root: Value = serde_json::from_str(text).map_err(|e| format!("not JSON: {e}"))?;
    let event = root
        .get("event")
        .and_then(Value::as_str)
        .ok_or("missing event field")?;
    let data = root.get("data").cloned().unwrap_or(Value::Null);

    match event {
        "subscribe" => Ok(ClientRequest::Subscribe(parse_selector(&data)?)),
        "unsubscribe" => Ok(ClientRequest::Unsubscribe(parse_selector(&data)?)),
        "get_subscriptions" => Ok(ClientRequest::GetSubscriptions),
        "request_price" => {
            let instrument = data
                .get("instrument")
                .and_then(Value::as_str)
                .ok_or("request_price needs data.instrument")?;
            Ok(ClientRequest::RequestPrice(instrument.to_string()))
        }
        "request_all_prices" => Ok(ClientRequest::RequestAllPrices),
        "get_server_stats" => Ok(ClientRequest::GetServerStats),
        "ping" => Ok(ClientRequest::Ping),
        other => Err(format!("unknown event: {other}")),
    }
}

fn parse_selector(data: &Value) -> Result<PairSelector, String> {
    match data.get("pairs") {
        Some(Value::String(s)) if s == "*" => Ok(PairSelector::Wildcard),
        Some(Value::String(s)) => Err(format!("pairs must be a list or \"*\", got {s:?}")),
        Some(Value::Array(items)) => {
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => pairs.push(s.to_string()),
                    None => return Err("pairs entries must be strings".into()),
                }
            }
            Ok(PairSelector::Pairs(pairs))
        }
        _ => Err("missing data.pairs".into()),
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Serialize one outbound frame.
pub fn envelope(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

pub fn connection_established(client_id: &str, tracked: &[Instrument]) -> String {
    envelope(
        "connection_established",
        json!({
            "client_id": client_id,
            "tracked_pairs": tracked,
            "server_time": Utc::now(),
        }),
    )
}

pub fn connection_rejected(reason: &str) -> String {
    envelope("connection_rejected", json!({ "reason": reason }))
}

pub fn subscription_confirmed(wildcard: bool, pairs: &[String]) -> String {
    envelope(
        "subscription_confirmed",
        json!({ "wildcard": wildcard, "pairs": pairs, "count": pairs.len() }),
    )
}

pub fn unsubscription_confirmed(wildcard: bool, pairs: &[String]) -> String {
    envelope(
        "unsubscription_confirmed",
        json!({ "wildcard": wildcard, "pairs": pairs, "count": pairs.len() }),
    )
}

pub fn subscription_error(invalid: &[String]) -> String {
    envelope(
        "subscription_error",
        json!({
            "message": "unknown instruments; no changes applied",
            "invalid_pairs": invalid,
        }),
    )
}

pub fn subscriptions_info(wildcard: bool, pairs: &[String]) -> String {
    envelope(
        "subscriptions_info",
        json!({ "wildcard": wildcard, "pairs": pairs, "count": pairs.len() }),
    )
}

pub fn price_response(instrument: &str, price: Option<Value>) -> String {
    match price {
        Some(value) => envelope(
            "price_response",
            json!({ "instrument": instrument, "price": value }),
        ),
        None => envelope(
            "price_response",
            json!({ "instrument": instrument, "price": Value::Null, "error": "not-found" }),
        ),
    }
}

pub fn all_prices_response(prices: &[(String, Value)]) -> String {
    let mut map = serde_json::Map::new();
    for (key, value) in prices {
        let instrument = key.strip_prefix("prices:").unwrap_or(key);
        map.insert(instrument.to_string(), value.clone());
    }
    envelope(
        "all_prices_response",
        json!({ "count": map.len(), "prices": Value::Object(map) }),
    )
}

pub fn server_stats(stats: &crate::fanout::rooms::ServerStats) -> String {
    envelope(
        "server_stats",
        json!({
            "active_sessions": stats.active_sessions,
            "total_subscriptions": stats.total_subscriptions,
            "wildcard_sessions": stats.wildcard_sessions,
            "avg_subscriptions_per_session": stats.avg_subscriptions_per_session,
        }),
    )
}

pub fn pong(server_time: DateTime<Utc>) -> String {
    envelope("pong", json!({ "server_time": server_time }))
}

/// Render a bus message as its relay frame. The bool marks whether the
/// frame may be shed under backpressure: only plain price updates are;
/// alerts and data_ready always get through or the session closes.
pub fn relay_frame(msg: &BusMessage) -> (String, bool) {
    let (event, droppable) = match msg {
        BusMessage::Price(_) => ("price_update", true),
        BusMessage::Volatility(_) => ("volatility_alert", false),
        BusMessage::Correlation(_) => ("correlation_alert", false),
        BusMessage::DataReady(_) => ("data_ready", false),
    };
    (envelope(event, msg.to_json()), droppable)
}

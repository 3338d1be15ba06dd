// =============================================================================
// Fan-out Server — WebSocket sessions over axum
// =============================================================================
//
// Sessions connect at `/ws`, receive `connection_established` with a fresh
// client id and the tracked universe, then drive subscriptions with control
// frames while the relay pushes filtered bus traffic at them. The server
// never originates market data; it only fans out what the bus carries and
// answers point queries from the cache.
//
// Keep-alive is protocol-level: the server pings on an interval and closes
// sessions whose pong falls outside the timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{Cache, Channel};
use crate::config::Config;
use crate::fanout::messages::{
    self, parse_client_message, ClientRequest, PairSelector,
};
use crate::fanout::rooms::Registry;
use crate::types::Instrument;

/// Outbound frames a session may hold before shedding starts.
const OUTBOX_CAPACITY: usize = 256;

/// Everything a session handler needs, shared across the server.
pub struct FanoutState {
    pub registry: Registry,
    pub cache: Arc<Cache>,
    pub tracked: Vec<Instrument>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl FanoutState {
    pub fn new(config: &Config, cache: Arc<Cache>) -> Self {
        Self {
            registry: Registry::new(
                config.fanout_max_clients,
                OUTBOX_CAPACITY,
                config.fanout_max_drops,
            ),
            cache,
            tracked: config.tracked_pairs.clone(),
            ping_interval: config.fanout_ping_interval,
            ping_timeout: config.fanout_ping_timeout,
        }
    }
}

/// Build the fan-out router.
pub fn router(state: Arc<FanoutState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<FanoutState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "active_sessions": stats.active_sessions,
        "server_time": Utc::now(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<FanoutState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

// =============================================================================
// Session lifecycle
// =============================================================================

async fn handle_session(socket: WebSocket, state: Arc<FanoutState>) {
    let (mut sender, mut receiver) = socket.split();

    // Admission: over-cap sessions get a rejection frame, then the close.
    let (client_id, outbox) = match state.registry.register() {
        Ok(admitted) => admitted,
        Err(reason) => {
            let _ = sender
                .send(Message::Text(messages::connection_rejected(reason)))
                .await;
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let hello = messages::connection_established(&client_id.to_string(), &state.tracked);
    if sender.send(Message::Text(hello)).await.is_err() {
        state.registry.unregister(client_id);
        return;
    }

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + state.ping_interval,
        state.ping_interval,
    );
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // ── Drain the outbound queue ────────────────────────────────
            _ = outbox.wait() => {
                let (frames, close) = outbox.drain();
                let mut dead = false;
                for frame in frames {
                    if sender.send(Message::Text(frame)).await.is_err() {
                        dead = true;
                        break;
                    }
                }
                if dead {
                    break;
                }
                if let Some(reason) = close {
                    warn!(client_id = %client_id, dropped = outbox.dropped(), reason, "closing slow session");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }

            // ── Inbound control frames ──────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&state, client_id, &outbox, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(client_id = %client_id, "close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(client_id = %client_id, "binary frame ignored");
                    }
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "receive error");
                        break;
                    }
                    None => break,
                }
            }

            // ── Keep-alive ──────────────────────────────────────────────
            _ = ping.tick() => {
                if last_pong.elapsed() > state.ping_interval + state.ping_timeout {
                    info!(client_id = %client_id, "session missed keep-alive, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.unregister(client_id);
}

/// Handle one inbound control frame: responses go through the outbox (never
/// sheddable) so they stay ordered with relays.
fn handle_client_text(state: &FanoutState, client_id: Uuid, outbox: &crate::fanout::rooms::Outbox, text: &str) {
    match parse_client_message(text) {
        Ok(request) => {
            for frame in process_request(state, client_id, request) {
                outbox.push(frame, false);
            }
        }
        Err(reason) => {
            warn!(client_id = %client_id, reason, "ignoring malformed control frame");
        }
    }
}

/// Compute the response frames for one control request.
fn process_request(state: &FanoutState, client_id: Uuid, request: ClientRequest) -> Vec<String> {
    match request {
        ClientRequest::Subscribe(PairSelector::Wildcard) => state
            .registry
            .subscribe_all(client_id)
            .map(|v| vec![messages::subscription_confirmed(v.wildcard, &v.pairs)])
            .unwrap_or_default(),

        ClientRequest::Subscribe(PairSelector::Pairs(names)) => {
            match validate_pairs(&names, &state.tracked) {
                Ok(pairs) => state
                    .registry
                    .subscribe(client_id, pairs)
                    .map(|v| vec![messages::subscription_confirmed(v.wildcard, &v.pairs)])
                    .unwrap_or_default(),
                // Any invalid instrument: report and change nothing.
                Err(invalid) => vec![messages::subscription_error(&invalid)],
            }
        }

        ClientRequest::Unsubscribe(PairSelector::Wildcard) => state
            .registry
            .unsubscribe_all(client_id)
            .map(|v| vec![messages::unsubscription_confirmed(v.wildcard, &v.pairs)])
            .unwrap_or_default(),

        ClientRequest::Unsubscribe(PairSelector::Pairs(names)) => {
            // Unknown names simply have nothing to remove.
            let pairs: Vec<Instrument> =
                names.iter().filter_map(|n| Instrument::new(n.clone())).collect();
            state
                .registry
                .unsubscribe(client_id, &pairs)
                .map(|v| vec![messages::unsubscription_confirmed(v.wildcard, &v.pairs)])
                .unwrap_or_default()
        }

        ClientRequest::GetSubscriptions => state
            .registry
            .subscriptions(client_id)
            .map(|v| vec![messages::subscriptions_info(v.wildcard, &v.pairs)])
            .unwrap_or_default(),

        ClientRequest::RequestPrice(name) => {
            let price = Instrument::new(name.clone())
                .map(|i| Cache::price_key(&i))
                .and_then(|key| state.cache.get(&key));
            vec![messages::price_response(&name, price)]
        }

        ClientRequest::RequestAllPrices => {
            vec![messages::all_prices_response(&state.cache.all_prices())]
        }

        ClientRequest::GetServerStats => {
            vec![messages::server_stats(&state.registry.stats())]
        }

        ClientRequest::Ping => vec![messages::pong(Utc::now())],
    }
}

/// Validate every name against the tracked set. All-or-nothing: one unknown
/// instrument rejects the whole request.
fn validate_pairs(names: &[String], tracked: &[Instrument]) -> Result<Vec<Instrument>, Vec<String>> {
    let mut valid = Vec::with_capacity(names.len());
    let mut invalid = Vec::new();
    for name in names {
        match Instrument::new(name.clone()) {
            Some(i) if tracked.contains(&i) => valid.push(i),
            _ => invalid.push(name.clone()),
        }
    }
    if invalid.is_empty() {
        Ok(valid)
    } else {
        Err(invalid)
    }
}

// =============================================================================
// Bus relay
// =============================================================================

/// Long-lived task feeding the session registry from the bus. Lag is logged
/// and survived; a closed bus is fatal, the server cannot run without it.
pub async fn run_relay(state: Arc<FanoutState>) -> anyhow::Result<()> {
    let bus = state.cache.bus();
    let mut price_rx = bus.subscribe(Channel::PriceUpdates);
    let mut volatility_rx = bus.subscribe(Channel::VolatilityAlerts);
    let mut correlation_rx = bus.subscribe(Channel::CorrelationAlerts);
    let mut ready_rx = bus.subscribe(Channel::DataReady);

    info!("bus relay attached to all channels");

    loop {
        let received = tokio::select! {
            r = price_rx.recv() => (Channel::PriceUpdates, r),
            r = volatility_rx.recv() => (Channel::VolatilityAlerts, r),
            r = correlation_rx.recv() => (Channel::CorrelationAlerts, r),
            r = ready_rx.recv() => (Channel::DataReady, r),
        };

        match received {
            (_, Ok(msg)) => state.registry.relay(&msg),
            (channel, Err(RecvError::Lagged(missed))) => {
                warn!(channel = %channel, missed, "relay lagged behind the bus");
            }
            (channel, Err(RecvError::Closed)) => {
                error!(channel = %channel, "bus channel closed; fan-out cannot continue");
                return Err(anyhow!("bus channel {channel} closed"));
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheTtls;
    use serde_json::Value;

    fn inst(s: &str) -> Instrument {
        Instrument::new(s).unwrap()
    }

    fn test_state() -> Arc<FanoutState> {
        let cache = Arc::new(Cache::new(CacheTtls {
            prices: Duration::from_secs(300),
            metrics: Duration::from_secs(3600),
            correlation: Duration::from_secs(86_400),
        }));
        Arc::new(FanoutState {
            registry: Registry::new(4, 64, 50),
            cache,
            tracked: vec![inst("EUR_USD"), inst("GBP_USD"), inst("XAU_USD")],
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(5),
        })
    }

    fn frame(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn subscribe_then_get_subscriptions() {
        let state = test_state();
        let (id, _outbox) = state.registry.register().unwrap();

        let frames = process_request(
            &state,
            id,
            ClientRequest::Subscribe(PairSelector::Pairs(vec!["EUR_USD".into()])),
        );
        assert_eq!(frame(&frames[0])["event"], "subscription_confirmed");
        assert_eq!(frame(&frames[0])["data"]["pairs"][0], "EUR_USD");

        let frames = process_request(&state, id, ClientRequest::GetSubscriptions);
        let v = frame(&frames[0]);
        assert_eq!(v["event"], "subscriptions_info");
        assert_eq!(v["data"]["count"], 1);
    }

    #[test]
    fn invalid_subscribe_changes_nothing() {
        let state = test_state();
        let (id, _outbox) = state.registry.register().unwrap();

        let frames = process_request(
            &state,
            id,
            ClientRequest::Subscribe(PairSelector::Pairs(vec![
                "EUR_USD".into(),
                "DOGE_MOON".into(), // not tracked
            ])),
        );
        let v = frame(&frames[0]);
        assert_eq!(v["event"], "subscription_error");
        assert_eq!(v["data"]["invalid_pairs"][0], "DOGE_MOON");

        // The valid half of the request must not have been applied.
        let subs = state.registry.subscriptions(id).unwrap();
        assert!(subs.pairs.is_empty());
    }

    #[test]
    fn wildcard_subscription_roundtrip() {
        let state = test_state();
        let (id, _outbox) = state.registry.register().unwrap();

        let frames =
            process_request(&state, id, ClientRequest::Subscribe(PairSelector::Wildcard));
        assert_eq!(frame(&frames[0])["data"]["wildcard"], true);

        let frames =
            process_request(&state, id, ClientRequest::Unsubscribe(PairSelector::Wildcard));
        let v = frame(&frames[0]);
        assert_eq!(v["event"], "unsubscription_confirmed");
        assert_eq!(v["data"]["wildcard"], false);
        assert_eq!(v["data"]["count"], 0);
    }

    #[test]
    fn price_request_reads_the_cache() {
        let state = test_state();
        let (id, _outbox) = state.registry.register().unwrap();

        let frames = process_request(
            &state,
            id,
            ClientRequest::RequestPrice("EUR_USD".into()),
        );
        let v = frame(&frames[0]);
        assert_eq!(v["event"], "price_response");
        assert_eq!(v["data"]["error"], "not-found");

        state.cache.put(
            "prices:EUR_USD",
            serde_json::json!({"bid": "1.0999", "ask": "1.1001", "mid": "1.1000"}),
            Duration::from_secs(60),
        );
        let frames = process_request(
            &state,
            id,
            ClientRequest::RequestPrice("EUR_USD".into()),
        );
        let v = frame(&frames[0]);
        assert_eq!(v["data"]["price"]["mid"], "1.1000");
    }

    #[test]
    fn all_prices_and_stats() {
        let state = test_state();
        let (id, _outbox) = state.registry.register().unwrap();
        state.cache.put(
            "prices:EUR_USD",
            serde_json::json!({"mid": "1.1"}),
            Duration::from_secs(60),
        );
        state.cache.put(
            "prices:GBP_USD",
            serde_json::json!({"mid": "1.3"}),
            Duration::from_secs(60),
        );

        let frames = process_request(&state, id, ClientRequest::RequestAllPrices);
        let v = frame(&frames[0]);
        assert_eq!(v["event"], "all_prices_response");
        assert_eq!(v["data"]["count"], 2);

        let frames = process_request(&state, id, ClientRequest::GetServerStats);
        let v = frame(&frames[0]);
        assert_eq!(v["event"], "server_stats");
        assert_eq!(v["data"]["active_sessions"], 1);
    }

    #[test]
    fn ping_pongs_with_server_time() {
        let state = test_state();
        let (id, _outbox) = state.registry.register().unwrap();
        let frames = process_request(&state, id, ClientRequest::Ping);
        let v = frame(&frames[0]);
        assert_eq!(v["event"], "pong");
        assert!(v["data"]["server_time"].is_string());
    }

    #[tokio::test]
    async fn relay_task_feeds_sessions_from_the_bus() {
        let state = test_state();
        let (id, outbox) = state.registry.register().unwrap();
        state.registry.subscribe(id, vec![inst("EUR_USD")]).unwrap();

        let relay_state = state.clone();
        let relay = tokio::spawn(async move { run_relay(relay_state).await });

        // Give the relay a beat to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        state
            .cache
            .bus()
            .publish(crate::cache::BusMessage::Price(crate::cache::PriceUpdate {
                instrument: inst("EUR_USD"),
                price: crate::cache::PricePoint {
                    bid: "1.0".parse().unwrap(),
                    ask: "1.0".parse().unwrap(),
                    mid: "1.0".parse().unwrap(),
                    time: Utc::now(),
                },
                timestamp: Utc::now(),
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let (frames, _) = outbox.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frame(&frames[0])["event"], "price_update");

        relay.abort();
    }
}

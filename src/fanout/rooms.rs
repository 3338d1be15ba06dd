// =============================================================================
// Session Registry & Rooms — who is connected, what they hear
// =============================================================================
//
// Rooms are bookkeeping only: each session carries a subscription set
// (explicit instruments, or the wildcard), and a relay delivers a bus message
// to exactly the sessions whose set matches. The registry map sits behind a
// single mutex; membership changes are O(1) under that lock, and relays
// snapshot the matching outboxes before sending so the lock is never held
// across socket work.
//
// Backpressure: each session owns a bounded outbound queue. When it fills,
// the oldest queued price update is shed first (alerts and data_ready are
// never shed); a session that keeps losing frames past the drop limit is
// closed as a slow consumer.

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::BusMessage;
use crate::fanout::messages::relay_frame;
use crate::types::Instrument;

/// Close reason for a session that cannot keep up.
pub const SLOW_CONSUMER: &str = "slow-consumer";
/// Rejection reason when the session cap is reached.
pub const CAPACITY: &str = "capacity";

// =============================================================================
// Subscription set
// =============================================================================

/// A session's room membership: explicit instruments plus an optional
/// wildcard that matches everything.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    wildcard: bool,
    pairs: BTreeSet<Instrument>,
}

impl SubscriptionSet {
    pub fn subscribe_all(&mut self) {
        self.wildcard = true;
    }

    pub fn subscribe(&mut self, pairs: impl IntoIterator<Item = Instrument>) {
        self.pairs.extend(pairs);
    }

    pub fn unsubscribe_all(&mut self) {
        self.wildcard = false;
        self.pairs.clear();
    }

    pub fn unsubscribe(&mut self, pairs: &[Instrument]) {
        for p in pairs {
            self.pairs.remove(p);
        }
    }

    pub fn matches(&self, instrument: &Instrument) -> bool {
        self.wildcard || self.pairs.contains(instrument)
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn pair_names(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.as_str().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.wildcard && self.pairs.is_empty()
    }
}

// =============================================================================
// Outbox
// =============================================================================

#[derive(Debug)]
struct QueuedFrame {
    text: String,
    droppable: bool,
}

#[derive(Debug)]
struct OutboxInner {
    queue: VecDeque<QueuedFrame>,
    dropped: u64,
    close_reason: Option<&'static str>,
}

/// Bounded per-session outbound queue. The session's writer task drains it;
/// the relay and control handlers push into it.
#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    max_drops: u64,
    inner: Mutex<OutboxInner>,
    notify: Notify,
}

impl Outbox {
    pub fn new(capacity: usize, max_drops: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            max_drops,
            inner: Mutex::new(OutboxInner {
                queue: VecDeque::new(),
                dropped: 0,
                close_reason: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue a frame, shedding under backpressure per the policy above.
    pub fn push(&self, text: String, droppable: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.close_reason.is_some() {
                return;
            }

            if inner.queue.len() >= self.capacity {
                if let Some(pos) = inner.queue.iter().position(|f| f.droppable) {
                    // Shed the oldest unsent price update.
                    inner.queue.remove(pos);
                    inner.dropped += 1;
                } else if droppable {
                    // Queue is all must-deliver frames; the incoming price
                    // update is the one to lose.
                    inner.dropped += 1;
                    if inner.dropped > self.max_drops {
                        inner.close_reason = Some(SLOW_CONSUMER);
                    }
                    self.notify.notify_one();
                    return;
                } else {
                    // Nothing sheddable and the incoming frame must not be
                    // lost: the session is beyond saving.
                    inner.close_reason = Some(SLOW_CONSUMER);
                    self.notify.notify_one();
                    return;
                }

                if inner.dropped > self.max_drops {
                    inner.close_reason = Some(SLOW_CONSUMER);
                }
            }

            inner.queue.push_back(QueuedFrame { text, droppable });
        }
        self.notify.notify_one();
    }

    /// Take every queued frame plus the pending close reason, if any.
    pub fn drain(&self) -> (Vec<String>, Option<&'static str>) {
        let mut inner = self.inner.lock();
        let frames = inner.queue.drain(..).map(|f| f.text).collect();
        (frames, inner.close_reason)
    }

    /// Wait until something is pushed (or a close is flagged).
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Total frames shed so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        self.inner.lock().close_reason
    }
}

// =============================================================================
// Registry
// =============================================================================

struct SessionEntry {
    subs: SubscriptionSet,
    outbox: std::sync::Arc<Outbox>,
    connected_at: DateTime<Utc>,
}

/// Counts reported to `get_server_stats`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerStats {
    pub active_sessions: usize,
    pub total_subscriptions: usize,
    pub wildcard_sessions: usize,
    pub avg_subscriptions_per_session: f64,
}

/// A session's subscription state as reported back over the wire.
#[derive(Debug, Clone)]
pub struct SubscriptionsView {
    pub wildcard: bool,
    pub pairs: Vec<String>,
}

/// All connected sessions and their rooms.
pub struct Registry {
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    max_clients: usize,
    queue_capacity: usize,
    max_drops: u64,
}

impl Registry {
    pub fn new(max_clients: usize, queue_capacity: usize, max_drops: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_clients,
            queue_capacity,
            max_drops,
        }
    }

    /// Admit a new session, or refuse it when the cap is reached.
    pub fn register(&self) -> Result<(Uuid, std::sync::Arc<Outbox>), &'static str> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_clients {
            warn!(
                active = sessions.len(),
                cap = self.max_clients,
                "session rejected at capacity"
            );
            return Err(CAPACITY);
        }

        let id = Uuid::new_v4();
        let outbox = std::sync::Arc::new(Outbox::new(self.queue_capacity, self.max_drops));
        sessions.insert(
            id,
            SessionEntry {
                subs: SubscriptionSet::default(),
                outbox: outbox.clone(),
                connected_at: Utc::now(),
            },
        );
        info!(client_id = %id, active = sessions.len(), "session registered");
        Ok((id, outbox))
    }

    /// Remove a session and release its room memberships.
    pub fn unregister(&self, id: Uuid) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.remove(&id) {
            let connected_secs = (Utc::now() - entry.connected_at).num_seconds();
            info!(
                client_id = %id,
                connected_secs,
                dropped = entry.outbox.dropped(),
                active = sessions.len(),
                "session unregistered"
            );
        }
    }

    fn with_session<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Option<T> {
        let mut sessions = self.sessions.lock();
        sessions.get_mut(&id).map(f)
    }

    pub fn subscribe_all(&self, id: Uuid) -> Option<SubscriptionsView> {
        self.with_session(id, |s| {
            s.subs.subscribe_all();
            view(&s.subs)
        })
    }

    pub fn subscribe(&self, id: Uuid, pairs: Vec<Instrument>) -> Option<SubscriptionsView> {
        self.with_session(id, |s| {
            s.subs.subscribe(pairs);
            view(&s.subs)
        })
    }

    pub fn unsubscribe_all(&self, id: Uuid) -> Option<SubscriptionsView> {
        self.with_session(id, |s| {
            s.subs.unsubscribe_all();
            view(&s.subs)
        })
    }

    pub fn unsubscribe(&self, id: Uuid, pairs: &[Instrument]) -> Option<SubscriptionsView> {
        self.with_session(id, |s| {
            s.subs.unsubscribe(pairs);
            view(&s.subs)
        })
    }

    pub fn subscriptions(&self, id: Uuid) -> Option<SubscriptionsView> {
        self.with_session(id, |s| view(&s.subs))
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a bus message to every matching session.
    ///
    /// Messages tagged with an instrument go to sessions whose room set
    /// matches it; untagged messages (correlation alerts, data_ready) go to
    /// everyone. The frame is rendered once; recipients are snapshotted
    /// under the lock and pushed to outside it.
    pub fn relay(&self, msg: &BusMessage) {
        let (text, droppable) = relay_frame(msg);

        let recipients: Vec<std::sync::Arc<Outbox>> = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .filter(|s| match msg.instrument() {
                    Some(instrument) => s.subs.matches(instrument),
                    None => true,
                })
                .map(|s| s.outbox.clone())
                .collect()
        };

        debug!(
            channel = %msg.channel(),
            recipients = recipients.len(),
            "relaying bus message"
        );
        for outbox in recipients {
            outbox.push(text.clone(), droppable);
        }
    }

    pub fn stats(&self) -> ServerStats {
        let sessions = self.sessions.lock();
        let active_sessions = sessions.len();
        let total_subscriptions: usize = sessions.values().map(|s| s.subs.len()).sum();
        let wildcard_sessions = sessions.values().filter(|s| s.subs.is_wildcard()).count();
        ServerStats {
            active_sessions,
            total_subscriptions,
            wildcard_sessions,
            avg_subscriptions_per_session: if active_sessions > 0 {
                total_subscriptions as f64 / active_sessions as f64
            } else {
                0.0
            },
        }
    }
}

fn view(subs: &SubscriptionSet) -> SubscriptionsView {
    SubscriptionsView {
        wildcard: subs.is_wildcard(),
        pairs: subs.pair_names(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DataReady, DataType, PricePoint, PriceUpdate};
    use chrono::TimeZone;

    fn inst(s: &str) -> Instrument {
        Instrument::new(s).unwrap()
    }

    fn price_msg(instrument: &str) -> BusMessage {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        BusMessage::Price(PriceUpdate {
            instrument: inst(instrument),
            price: PricePoint {
                bid: "1.0".parse().unwrap(),
                ask: "1.0".parse().unwrap(),
                mid: "1.0".parse().unwrap(),
                time: t,
            },
            timestamp: t,
        })
    }

    fn ready_msg() -> BusMessage {
        BusMessage::DataReady(DataReady {
            data_type: DataType::Prices,
            count: 1,
            timestamp: Utc::now(),
            message: None,
        })
    }

    #[test]
    fn relay_respects_rooms_and_wildcards() {
        let registry = Registry::new(10, 64, 50);
        let (a, a_box) = registry.register().unwrap();
        let (b, b_box) = registry.register().unwrap();
        registry.subscribe(a, vec![inst("EUR_USD")]).unwrap();
        registry.subscribe_all(b).unwrap();

        // GBP_USD price: wildcard session hears it, the explicit one does not.
        registry.relay(&price_msg("GBP_USD"));
        assert_eq!(a_box.drain().0.len(), 0);
        assert_eq!(b_box.drain().0.len(), 1);

        // data_ready reaches both.
        registry.relay(&ready_msg());
        assert_eq!(a_box.drain().0.len(), 1);
        assert_eq!(b_box.drain().0.len(), 1);

        // EUR_USD price reaches both.
        registry.relay(&price_msg("EUR_USD"));
        assert_eq!(a_box.drain().0.len(), 1);
        assert_eq!(b_box.drain().0.len(), 1);
    }

    #[test]
    fn subscriptions_track_client_bookkeeping() {
        // Mirror the registry against a locally-maintained set through a
        // mixed subscribe/unsubscribe sequence; they must agree throughout.
        let registry = Registry::new(10, 64, 50);
        let (id, _outbox) = registry.register().unwrap();
        let mut expected: BTreeSet<&str> = BTreeSet::new();

        let script: &[(bool, &str)] = &[
            (true, "EUR_USD"),
            (true, "GBP_USD"),
            (false, "EUR_USD"),
            (true, "USD_JPY"),
            (true, "GBP_USD"), // duplicate subscribe is a no-op
            (false, "XAU_USD"), // unsubscribing a non-member is a no-op
            (true, "AUD_USD"),
            (false, "GBP_USD"),
        ];

        for (add, name) in script {
            if *add {
                registry.subscribe(id, vec![inst(name)]).unwrap();
                expected.insert(name);
            } else {
                registry.unsubscribe(id, &[inst(name)]).unwrap();
                expected.remove(name);
            }
            let got = registry.subscriptions(id).unwrap();
            let want: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
            assert_eq!(got.pairs, want);
            assert!(!got.wildcard);
        }
    }

    #[test]
    fn wildcard_unsubscribe_clears_everything() {
        let registry = Registry::new(10, 64, 50);
        let (id, _outbox) = registry.register().unwrap();
        registry.subscribe(id, vec![inst("EUR_USD"), inst("GBP_USD")]).unwrap();
        registry.subscribe_all(id).unwrap();

        let v = registry.subscriptions(id).unwrap();
        assert!(v.wildcard);
        assert_eq!(v.pairs.len(), 2);

        let v = registry.unsubscribe_all(id).unwrap();
        assert!(!v.wildcard);
        assert!(v.pairs.is_empty());
    }

    #[test]
    fn capacity_cap_rejects_new_sessions() {
        let registry = Registry::new(2, 64, 50);
        let _a = registry.register().unwrap();
        let _b = registry.register().unwrap();
        assert_eq!(registry.register().unwrap_err(), CAPACITY);

        // Freeing a slot readmits.
        registry.unregister(_a.0);
        assert!(registry.register().is_ok());
    }

    #[test]
    fn unregister_releases_rooms() {
        let registry = Registry::new(10, 64, 50);
        let (id, outbox) = registry.register().unwrap();
        registry.subscribe(id, vec![inst("EUR_USD")]).unwrap();
        registry.unregister(id);

        assert!(registry.subscriptions(id).is_none());
        registry.relay(&price_msg("EUR_USD"));
        assert_eq!(outbox.drain().0.len(), 0);
    }

    #[test]
    fn outbox_sheds_oldest_price_update_first() {
        let outbox = Outbox::new(3, 50);
        outbox.push("p1".into(), true);
        outbox.push("alert".into(), false);
        outbox.push("p2".into(), true);
        outbox.push("p3".into(), true); // full: p1 is shed

        let (frames, close) = outbox.drain();
        assert_eq!(frames, vec!["alert", "p2", "p3"]);
        assert!(close.is_none());
        assert_eq!(outbox.dropped(), 1);
    }

    #[test]
    fn alerts_are_never_shed() {
        let outbox = Outbox::new(2, 50);
        outbox.push("alert1".into(), false);
        outbox.push("alert2".into(), false);
        // Full of must-deliver frames; the incoming price update loses.
        outbox.push("price".into(), true);

        let (frames, close) = outbox.drain();
        assert_eq!(frames, vec!["alert1", "alert2"]);
        assert!(close.is_none());
        assert_eq!(outbox.dropped(), 1);
    }

    #[test]
    fn undeliverable_alert_closes_the_session() {
        let outbox = Outbox::new(2, 50);
        outbox.push("alert1".into(), false);
        outbox.push("alert2".into(), false);
        outbox.push("alert3".into(), false); // nothing sheddable

        assert_eq!(outbox.close_reason(), Some(SLOW_CONSUMER));
    }

    #[test]
    fn drop_limit_exhaustion_closes_the_session() {
        let outbox = Outbox::new(1, 2);
        outbox.push("p0".into(), true);
        for i in 1..=3 {
            outbox.push(format!("p{i}"), true); // each push sheds one
        }
        assert!(outbox.dropped() > 2);
        assert_eq!(outbox.close_reason(), Some(SLOW_CONSUMER));
    }

    #[test]
    fn stats_reflect_sessions_and_rooms() {
        let registry = Registry::new(10, 64, 50);
        let (a, _) = registry.register().unwrap();
        let (b, _) = registry.register().unwrap();
        let (c, _) = registry.register().unwrap();
        registry.subscribe(a, vec![inst("EUR_USD"), inst("GBP_USD")]).unwrap();
        registry.subscribe(b, vec![inst("EUR_USD")]).unwrap();
        registry.subscribe_all(c).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.active_sessions, 3);
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.wildcard_sessions, 1);
        assert!((stats.avg_subscriptions_per_session - 1.0).abs() < f64::EPSILON);
    }
}

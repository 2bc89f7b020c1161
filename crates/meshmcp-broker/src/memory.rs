//! In-memory broker backend.
//!
//! Single-process backend used by the demo server and the test suites.
//! Delivery is at-most-once: `ack` is a no-op and `nack` only records the
//! request. Subscriptions are live the moment `subscribe` returns, so
//! `ready` keeps its immediate default.
//!
//! Event ids are a zero-padded decimal sequence per broker instance, which
//! makes string ordering coincide with publish ordering and lets
//! `from_event_id` replay parse the cursor back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{BrokerError, BrokerResult};
use crate::topic::{Topic, TopicPattern};
use crate::traits::{AckHandle, Broker, Delivery, EventId, SubscribeOptions, Subscription};

/// Width of the zero-padded sequence in event ids.
const EVENT_ID_WIDTH: usize = 20;

/// Configuration for [`MemoryBroker`].
#[derive(Clone, Debug)]
pub struct MemoryBrokerConfig {
    /// Maximum number of messages retained for replay. Older messages are
    /// discarded; a replay cursor older than the window starts at the
    /// window's edge.
    pub max_retained: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self { max_retained: 1024 }
    }
}

/// A retained message in the replay log.
#[derive(Clone)]
struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Value,
    published_at: DateTime<Utc>,
}

struct SubscriberEntry {
    pattern: TopicPattern,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Delivery and retention state, guarded by one lock so that the retained
/// log append and the live fan-out are atomic: a subscriber added under the
/// same lock sees every message exactly once.
struct DeliveryState {
    log: VecDeque<StoredMessage>,
    subscribers: Vec<(u64, SubscriberEntry)>,
}

struct Shared {
    config: MemoryBrokerConfig,
    state: Mutex<DeliveryState>,
    seq: AtomicU64,
    next_sub_id: AtomicU64,
    closed: AtomicBool,
    /// Round-robin cursors keyed by (pattern, queue group).
    group_cursors: DashMap<(String, String), usize>,
}

/// In-memory [`Broker`] backend.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    /// Create a broker with the given retention config.
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(DeliveryState {
                    log: VecDeque::new(),
                    subscribers: Vec::new(),
                }),
                seq: AtomicU64::new(0),
                next_sub_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                group_cursors: DashMap::new(),
            }),
        }
    }

    fn format_event_id(seq: u64) -> EventId {
        EventId::new(format!("{seq:0width$}", width = EVENT_ID_WIDTH))
    }

    fn parse_event_id(id: &EventId) -> Option<u64> {
        id.as_str().parse().ok()
    }
}

struct NoopAck;

#[async_trait]
impl AckHandle for NoopAck {
    async fn ack(&self) {}

    async fn nack(&self, delay: Option<Duration>) {
        debug!(?delay, "nack on in-memory broker ignored (at-most-once)");
    }
}

fn make_delivery(stored: &StoredMessage) -> Delivery {
    Delivery::new(
        stored.payload.clone(),
        MemoryBroker::format_event_id(stored.seq),
        stored.subject.clone(),
        stored.published_at,
        1,
        Arc::new(NoopAck),
    )
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &Topic, payload: Value) -> BrokerResult<EventId> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let mut state = self.shared.state.lock();
        let seq = self.shared.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let stored = StoredMessage {
            seq,
            subject: topic.as_str().to_string(),
            payload,
            published_at: Utc::now(),
        };

        state.log.push_back(stored.clone());
        while state.log.len() > self.shared.config.max_retained {
            state.log.pop_front();
        }

        // Fan out: plain subscribers each get a copy; queue groups pick one
        // member per (pattern, group) by round robin.
        let mut matched_groups: Vec<(String, String, Vec<usize>)> = Vec::new();
        let mut dead = Vec::new();
        for (idx, (sub_id, entry)) in state.subscribers.iter().enumerate() {
            if !entry.pattern.matches(&stored.subject) {
                continue;
            }
            match &entry.queue_group {
                None => {
                    if entry.tx.send(make_delivery(&stored)).is_err() {
                        dead.push(*sub_id);
                    }
                }
                Some(group) => {
                    let key = (entry.pattern.as_str().to_string(), group.clone());
                    match matched_groups.iter_mut().find(|(p, g, _)| {
                        (p.as_str(), g.as_str()) == (key.0.as_str(), key.1.as_str())
                    }) {
                        Some((_, _, members)) => members.push(idx),
                        None => matched_groups.push((key.0, key.1, vec![idx])),
                    }
                }
            }
        }

        for (pattern, group, members) in matched_groups {
            let mut cursor = self
                .shared
                .group_cursors
                .entry((pattern, group))
                .or_insert(0);
            let pick = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let (sub_id, entry) = &state.subscribers[pick];
            if entry.tx.send(make_delivery(&stored)).is_err() {
                dead.push(*sub_id);
            }
        }

        if !dead.is_empty() {
            state.subscribers.retain(|(id, _)| !dead.contains(id));
        }

        trace!(subject = %stored.subject, seq, "published");
        Ok(Self::format_event_id(seq))
    }

    async fn subscribe(
        &self,
        pattern: &TopicPattern,
        options: SubscribeOptions,
    ) -> BrokerResult<Box<dyn Subscription>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let sub_id = self.shared.next_sub_id.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::unbounded_channel();

        let replay_after = match &options.from_event_id {
            None => u64::MAX,
            // An unparsable cursor did not come from this instance;
            // replay the whole retained window rather than lose data.
            Some(id) => Self::parse_event_id(id).unwrap_or(0),
        };

        {
            let mut state = self.shared.state.lock();
            if replay_after != u64::MAX {
                for stored in state.log.iter().filter(|m| m.seq > replay_after) {
                    if pattern.matches(&stored.subject) {
                        // Receiver is brand new, send cannot fail
                        let _ = tx.send(make_delivery(stored));
                    }
                }
            }
            state.subscribers.push((
                sub_id,
                SubscriberEntry {
                    pattern: pattern.clone(),
                    queue_group: options.queue_group,
                    tx,
                },
            ));
        }

        debug!(pattern = %pattern, sub_id, "subscribed");
        Ok(Box::new(MemorySubscription {
            sub_id,
            shared: Arc::clone(&self.shared),
            rx,
            live: true,
        }))
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let mut state = self.shared.state.lock();
        // Dropping the senders ends every open subscription stream
        state.subscribers.clear();
        state.log.clear();
        self.shared.group_cursors.clear();
    }
}

struct MemorySubscription {
    sub_id: u64,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    live: bool,
}

impl MemorySubscription {
    fn detach(&mut self) {
        if self.live {
            self.live = false;
            let mut state = self.shared.state.lock();
            state.subscribers.retain(|(id, _)| *id != self.sub_id);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) {
        self.detach();
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic(session: &str, request: &str) -> Topic {
        Topic::request_outbound(session, request)
    }

    #[tokio::test]
    async fn test_publish_subscribe_order() {
        let broker = MemoryBroker::default();
        let t = topic("s", "1");
        let mut sub = broker
            .subscribe(&TopicPattern::from(&t), SubscribeOptions::new())
            .await
            .unwrap();

        for i in 0..5 {
            broker.publish(&t, json!({"n": i})).await.unwrap();
        }

        for i in 0..5 {
            let d = sub.next().await.unwrap();
            assert_eq!(d.payload["n"], i);
            assert_eq!(d.subject, t.as_str());
        }
    }

    #[tokio::test]
    async fn test_event_ids_are_monotone_strings() {
        let broker = MemoryBroker::default();
        let t = topic("s", "1");
        let a = broker.publish(&t, json!(1)).await.unwrap();
        let b = broker.publish(&t, json!(2)).await.unwrap();
        assert!(a.as_str() < b.as_str());
    }

    #[tokio::test]
    async fn test_replay_strictly_after_cursor() {
        let broker = MemoryBroker::default();
        let t = Topic::background_outbound("s");

        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(broker.publish(&t, json!({"i": i})).await.unwrap());
        }

        // Resume after the first event: must see 1 and 2 only, then live
        let mut sub = broker
            .subscribe(
                &TopicPattern::from(&t),
                SubscribeOptions::new().from_event_id(ids[0].clone()),
            )
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap().payload["i"], 1);
        assert_eq!(sub.next().await.unwrap().payload["i"], 2);

        broker.publish(&t, json!({"i": 3})).await.unwrap();
        assert_eq!(sub.next().await.unwrap().payload["i"], 3);
    }

    #[tokio::test]
    async fn test_no_replay_without_cursor() {
        let broker = MemoryBroker::default();
        let t = Topic::background_outbound("s");
        broker.publish(&t, json!("old")).await.unwrap();

        let mut sub = broker
            .subscribe(&TopicPattern::from(&t), SubscribeOptions::new())
            .await
            .unwrap();
        broker.publish(&t, json!("new")).await.unwrap();

        assert_eq!(sub.next().await.unwrap().payload, json!("new"));
    }

    #[tokio::test]
    async fn test_queue_group_exclusive_delivery() {
        let broker = MemoryBroker::default();
        let t = Topic::background_outbound("s");
        let pattern = TopicPattern::from(&t);

        let mut a = broker
            .subscribe(&pattern, SubscribeOptions::new().queue_group("workers"))
            .await
            .unwrap();
        let mut b = broker
            .subscribe(&pattern, SubscribeOptions::new().queue_group("workers"))
            .await
            .unwrap();

        for i in 0..4 {
            broker.publish(&t, json!({"i": i})).await.unwrap();
        }

        // Exactly four deliveries across both members
        let mut seen = 0;
        for sub in [&mut a, &mut b] {
            while let Ok(Some(_)) =
                tokio::time::timeout(Duration::from_millis(20), sub.next()).await
            {
                seen += 1;
            }
        }
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let broker = MemoryBroker::default();
        let mut sub = broker
            .subscribe(
                &TopicPattern::session_wildcard("s"),
                SubscribeOptions::new(),
            )
            .await
            .unwrap();

        broker
            .publish(&Topic::request_outbound("s", "1"), json!(1))
            .await
            .unwrap();
        broker
            .publish(&Topic::background_outbound("other"), json!(2))
            .await
            .unwrap();
        broker
            .publish(&Topic::background_outbound("s"), json!(3))
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap().payload, json!(1));
        assert_eq!(sub.next().await.unwrap().payload, json!(3));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let broker = MemoryBroker::default();
        let t = topic("s", "1");
        let mut sub = broker
            .subscribe(&TopicPattern::from(&t), SubscribeOptions::new())
            .await
            .unwrap();

        sub.unsubscribe().await;
        sub.unsubscribe().await;

        broker.publish(&t, json!(1)).await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = MemoryBroker::default();
        let t = topic("s", "1");
        let mut sub = broker
            .subscribe(&TopicPattern::from(&t), SubscribeOptions::new())
            .await
            .unwrap();

        broker.close().await;

        assert!(matches!(
            broker.publish(&t, json!(1)).await,
            Err(BrokerError::Closed)
        ));
        assert!(matches!(
            broker
                .subscribe(&TopicPattern::from(&t), SubscribeOptions::new())
                .await,
            Err(BrokerError::Closed)
        ));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_retention_cap() {
        let broker = MemoryBroker::new(MemoryBrokerConfig { max_retained: 2 });
        let t = Topic::background_outbound("s");

        let first = broker.publish(&t, json!(0)).await.unwrap();
        broker.publish(&t, json!(1)).await.unwrap();
        broker.publish(&t, json!(2)).await.unwrap();

        // The window dropped event 1's predecessor; replay starts at the edge
        let mut sub = broker
            .subscribe(
                &TopicPattern::from(&t),
                SubscribeOptions::new().from_event_id(first),
            )
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().payload, json!(1));
        assert_eq!(sub.next().await.unwrap().payload, json!(2));
    }
}

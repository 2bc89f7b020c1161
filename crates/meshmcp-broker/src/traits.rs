//! Broker and subscription contracts.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::error::BrokerResult;
use crate::topic::{Topic, TopicPattern};

/// Broker-assigned event identifier.
///
/// Opaque to everyone but the issuing broker instance, which guarantees
/// monotonicity per subject and knows how to interpret one as a replay
/// cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId(String);

impl EventId {
    /// Wrap a raw id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Options for [`Broker::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Replay history strictly after this event id before going live.
    pub from_event_id: Option<EventId>,
    /// Competing-consumer group: each message goes to exactly one member.
    pub queue_group: Option<String>,
}

impl SubscribeOptions {
    /// Live-only subscription.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request replay from the event after `id`.
    pub fn from_event_id(mut self, id: EventId) -> Self {
        self.from_event_id = Some(id);
        self
    }

    /// Join a queue group.
    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }
}

/// Acknowledgement handle attached to a delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Acknowledge successful processing.
    async fn ack(&self);

    /// Negative-acknowledge; an at-least-once backend may redeliver after
    /// the given delay.
    async fn nack(&self, delay: Option<Duration>);
}

/// A message delivered on a subscription.
#[derive(Clone)]
pub struct Delivery {
    /// The published payload (a JSON-RPC message for MCP traffic)
    pub payload: Value,
    /// Broker-assigned, per-subject-monotone id
    pub event_id: EventId,
    /// The concrete subject this was published on
    pub subject: String,
    /// Publish timestamp
    pub published_at: DateTime<Utc>,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    ack: Arc<dyn AckHandle>,
}

impl Delivery {
    /// Build a delivery; used by backend implementations.
    pub fn new(
        payload: Value,
        event_id: EventId,
        subject: impl Into<String>,
        published_at: DateTime<Utc>,
        attempt: u32,
        ack: Arc<dyn AckHandle>,
    ) -> Self {
        Self {
            payload,
            event_id,
            subject: subject.into(),
            published_at,
            attempt,
            ack,
        }
    }

    /// Acknowledge this delivery.
    pub async fn ack(&self) {
        self.ack.ack().await;
    }

    /// Negative-acknowledge this delivery.
    pub async fn nack(&self, delay: Option<Duration>) {
        self.ack.nack(delay).await;
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event_id", &self.event_id)
            .field("subject", &self.subject)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// An open subscription: a lazy, ordered sequence of deliveries.
#[async_trait]
pub trait Subscription: Send {
    /// Synchronization point: once this returns, no message published
    /// strictly afterwards can be missed.
    ///
    /// Backends whose subscribe is synchronously live keep the default.
    async fn ready(&mut self) -> BrokerResult<()> {
        Ok(())
    }

    /// Await the next delivery. `None` means the subscription ended
    /// (unsubscribed or broker closed).
    async fn next(&mut self) -> Option<Delivery>;

    /// Tear down the subscription. Idempotent.
    async fn unsubscribe(&mut self);
}

/// Typed pub/sub over named subjects.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload on a subject. On success the payload is durably
    /// enqueued according to the backend's semantics.
    async fn publish(&self, topic: &Topic, payload: Value) -> BrokerResult<EventId>;

    /// Open a subscription on a pattern.
    ///
    /// Backends may refuse wildcard patterns they cannot implement, but a
    /// wildcard-free pattern is always accepted.
    async fn subscribe(
        &self,
        pattern: &TopicPattern,
        options: SubscribeOptions,
    ) -> BrokerResult<Box<dyn Subscription>>;

    /// Tear down the broker. Open subscriptions end.
    async fn close(&self);
}

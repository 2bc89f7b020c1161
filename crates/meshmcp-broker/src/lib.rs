//! # meshmcp-broker
//!
//! Typed publish/subscribe over named subjects, the backbone of the
//! horizontally-scaled transport: every JSON-RPC message between the HTTP
//! layer and the protocol engine travels through a [`Broker`].
//!
//! The contract (see the trait docs for the fine print):
//!
//! - per-subject delivery order matches publish order
//! - subscriptions can replay history strictly after a given event id
//! - queue groups deliver each message to exactly one member
//! - subject patterns support `*` (one segment) and a trailing `>`
//!
//! [`MemoryBroker`] is the in-process backend; queue backends (NATS
//! JetStream, a log store) implement the same traits out of tree.

pub mod error;
pub mod memory;
pub mod topic;

mod traits;

pub use error::{BrokerError, BrokerResult};
pub use memory::{MemoryBroker, MemoryBrokerConfig};
pub use topic::{Topic, TopicPattern};
pub use traits::{Broker, Delivery, EventId, SubscribeOptions, Subscription};

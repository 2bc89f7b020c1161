//! Engine-facing transport seam.
//!
//! The engine is transport-agnostic: it talks to any object implementing
//! [`ServerTransport`]. The transport resolves sessions, fabricates a
//! per-message [`MessageContext`], and hands classified messages to the
//! engine through the callback installed at connect time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use meshmcp_protocol::{McpResult, ParsedMessage, RequestId};

use crate::session::Session;

/// Routing options for an outgoing message.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Session the message belongs to. Required by broker-routed
    /// transports.
    pub session_id: Option<String>,
    /// Set when the message answers a specific client request; routes it
    /// onto the request-scoped subject.
    pub request_id: Option<RequestId>,
}

impl SendOptions {
    /// Route to a session's background channel.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            request_id: None,
        }
    }

    /// Route as the response to a specific request.
    pub fn request(session_id: impl Into<String>, request_id: RequestId) -> Self {
        Self {
            session_id: Some(session_id.into()),
            request_id: Some(request_id),
        }
    }
}

/// Per-message context fabricated by the transport.
#[derive(Clone, Debug)]
pub struct MessageContext {
    /// Tag identifying the transport instance that received the message
    pub instance_id: String,
    /// The resolved session, when one exists
    pub session: Option<Session>,
}

impl MessageContext {
    /// The session id, if a session was resolved.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(Session::id)
    }
}

/// Transport-supplied delivery metadata.
#[derive(Clone, Debug)]
pub struct MessageInfo {
    /// When the transport received the message
    pub received_at: DateTime<Utc>,
    /// Opaque metadata (header snapshot, peer address, ...)
    pub metadata: HashMap<String, String>,
}

impl Default for MessageInfo {
    fn default() -> Self {
        Self {
            received_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// Callback the engine installs on a transport at connect time.
pub type IncomingCallback =
    Arc<dyn Fn(ParsedMessage, MessageContext, MessageInfo) + Send + Sync>;

/// A transport as seen from the engine.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Install the incoming-message callback. Called once, before
    /// `connect`.
    fn set_incoming(&self, callback: IncomingCallback);

    /// Bring the transport up.
    async fn connect(&self) -> McpResult<()>;

    /// Tear the transport down.
    async fn disconnect(&self) -> McpResult<()>;

    /// Emit a message with the given routing.
    async fn send(&self, message: serde_json::Value, options: SendOptions) -> McpResult<()>;
}

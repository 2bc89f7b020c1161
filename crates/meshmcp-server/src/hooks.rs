//! Engine lifecycle hooks.

use meshmcp_protocol::{McpError, ParsedMessage};
use serde_json::Value;

use crate::transport::MessageContext;

/// Observation points around the engine's message flow.
///
/// All methods default to no-ops; implement the ones you need. Hooks run
/// inline on the dispatch path and must not block.
pub trait EngineHooks: Send + Sync {
    /// An incoming message is about to be dispatched.
    fn on_before_receive(&self, _message: &ParsedMessage, _ctx: &MessageContext) {}

    /// Dispatch of an incoming message finished.
    fn on_after_receive(&self, _message: &ParsedMessage, _ctx: &MessageContext) {}

    /// An outgoing request is about to be handed to the transport.
    fn on_before_send_request(&self, _message: &Value) {}

    /// An outgoing request was handed to the transport.
    fn on_after_send_request(&self, _message: &Value) {}

    /// An outgoing notification is about to be handed to the transport.
    fn on_before_send_notification(&self, _message: &Value) {}

    /// An outgoing notification was handed to the transport.
    fn on_after_send_notification(&self, _message: &Value) {}

    /// A handler failed; the error is about to be serialized into a
    /// JSON-RPC error response.
    fn on_handler_error(&self, _method: &str, _error: &McpError) {}

    /// The engine closed.
    fn on_close(&self) {}
}

/// The default hook set: does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}

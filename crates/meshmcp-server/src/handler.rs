//! Method handler contract.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use meshmcp_protocol::{McpError, McpResult, RequestId};

use crate::context::{ContextLogger, IdGenerator};
use crate::engine::ProtocolFacade;
use crate::session::Session;

/// The message handed to a handler: a request (id present) or a
/// notification (id absent).
#[derive(Clone, Debug)]
pub struct HandlerMessage {
    /// Method name
    pub method: String,
    /// Parameters
    pub params: Option<Value>,
    /// Request id; `None` for notifications
    pub id: Option<RequestId>,
}

impl HandlerMessage {
    /// Deserialize the params into a concrete type.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> McpResult<T> {
        let params = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(params)
            .map_err(|e| McpError::invalid_params(format!("invalid params: {e}")))
    }
}

/// Per-call context: who is asking, with which session, and how to log.
#[derive(Clone)]
pub struct HandlerContext {
    /// Structured logger bound to this call's coordinates
    pub logger: ContextLogger,
    /// Id generator for handler-minted identifiers
    pub id_generator: Arc<dyn IdGenerator>,
    /// The resolved session, when the transport supplied one
    pub session: Option<Session>,
    /// Tag of the transport instance that received the message
    pub instance_id: String,
}

/// Per-call delivery info.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    /// Method name, duplicated for convenience
    pub method: String,
    /// When the transport received the message
    pub received_at: DateTime<Utc>,
    /// Transport-supplied metadata
    pub metadata: HashMap<String, String>,
    /// Cancellation signal; tripped when the peer cancels this request.
    /// Handlers may ignore it, but a well-behaved one polls it or wires it
    /// into downstream I/O.
    pub cancellation: CancellationToken,
}

/// A registered method handler.
///
/// Request handlers return the result value that becomes the JSON-RPC
/// `result`. Notification handlers are invoked through the same table;
/// their return value is discarded and they may not reply.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handle one message.
    async fn handle(
        &self,
        facade: ProtocolFacade,
        message: HandlerMessage,
        ctx: HandlerContext,
        info: RequestInfo,
    ) -> McpResult<Value>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = McpResult<Value>> + Send>>;
type HandlerFn = dyn Fn(ProtocolFacade, HandlerMessage, HandlerContext, RequestInfo) -> HandlerFuture
    + Send
    + Sync;

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler {
    f: Box<HandlerFn>,
}

impl FnHandler {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ProtocolFacade, HandlerMessage, HandlerContext, RequestInfo) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        Self {
            f: Box::new(move |facade, message, ctx, info| {
                Box::pin(f(facade, message, ctx, info))
            }),
        }
    }
}

#[async_trait]
impl MethodHandler for FnHandler {
    async fn handle(
        &self,
        facade: ProtocolFacade,
        message: HandlerMessage,
        ctx: HandlerContext,
        info: RequestInfo,
    ) -> McpResult<Value> {
        (self.f)(facade, message, ctx, info).await
    }
}

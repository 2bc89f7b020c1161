//! The protocol engine.
//!
//! A transport-agnostic JSON-RPC engine that manages multiple connections,
//! correlates outgoing requests with incoming responses keyed by
//! `(connection, session, request-id)`, dispatches incoming requests and
//! notifications to registered handlers, handles cancellation and progress,
//! and enforces timeouts.
//!
//! Scheduling model: incoming messages are processed on spawned tokio
//! tasks. Every table shared across flows is a `DashMap`; a pending entry
//! is settled by whichever flow removes it first, so each of
//! {response, error, timeout, cancel, close} completes a request at most
//! once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meshmcp_protocol::{
    CancelledParams, JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload, McpError, McpResult,
    ParsedMessage, ProgressParams, ProgressToken, RequestId, methods,
};

use crate::config::EngineConfig;
use crate::context::{ContextLogger, GenerateOptions};
use crate::feature::{Feature, FeatureContext};
use crate::handler::{HandlerContext, HandlerMessage, MethodHandler, RequestInfo};
use crate::hooks::EngineHooks;
use crate::session::Session;
use crate::transport::{MessageContext, MessageInfo, SendOptions, ServerTransport};

/// Identifier of a connection, unique within the engine's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// The id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation key pairing outgoing requests with their responses.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CorrelationKey {
    connection: ConnectionId,
    session: Option<String>,
    request: RequestId,
}

/// Secondary key routing progress notifications back to a pending request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ProgressKey {
    connection: ConnectionId,
    session: Option<String>,
    token: ProgressToken,
}

/// Progress callback registered on an outgoing request.
pub type ProgressCallback = Arc<dyn Fn(ProgressParams) + Send + Sync>;

/// Options for [`ProtocolEngine::send`] and [`ProtocolEngine::request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Session the message routes to.
    pub session_id: Option<String>,
    /// Response wait ceiling; falls back to the engine default (60s).
    pub timeout: Option<Duration>,
    /// Absolute cap on the wait, even with timeout resets.
    pub max_total_timeout: Option<Duration>,
    /// Restart the timeout whenever a progress notification arrives for
    /// this request's token.
    pub reset_timeout_on_progress: bool,
    /// Invoked with each progress notification routed to this request.
    pub on_progress: Option<ProgressCallback>,
    /// External abort: cancelling this token stops waiting on the response.
    pub signal: Option<CancellationToken>,
}

impl RequestOptions {
    /// Route to a session.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Set the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Restart the timeout on every progress notification.
    pub fn with_reset_timeout_on_progress(mut self, reset: bool) -> Self {
        self.reset_timeout_on_progress = reset;
        self
    }

    /// Cap the absolute wait.
    pub fn with_max_total_timeout(mut self, cap: Duration) -> Self {
        self.max_total_timeout = Some(cap);
        self
    }

    /// Wire an external abort signal.
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("session_id", &self.session_id)
            .field("timeout", &self.timeout)
            .field("reset_timeout_on_progress", &self.reset_timeout_on_progress)
            .field("has_progress", &self.on_progress.is_some())
            .finish_non_exhaustive()
    }
}

/// A pending outgoing request.
struct PendingEntry {
    tx: Mutex<Option<oneshot::Sender<McpResult<JsonRpcResponse>>>>,
    timeout: Duration,
    max_deadline: Option<tokio::time::Instant>,
    reset_on_progress: bool,
    on_progress: Option<ProgressCallback>,
    progress_token: Option<ProgressToken>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
    config: EngineConfig,
    connections: DashMap<ConnectionId, Arc<dyn ServerTransport>>,
    handlers: DashMap<String, Arc<dyn MethodHandler>>,
    pending: DashMap<CorrelationKey, Arc<PendingEntry>>,
    progress_index: DashMap<ProgressKey, CorrelationKey>,
    incoming: DashMap<CorrelationKey, CancellationToken>,
    closed: AtomicBool,
}

/// The protocol engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

impl ProtocolEngine {
    /// Create an engine.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                connections: DashMap::new(),
                handlers: DashMap::new(),
                pending: DashMap::new(),
                progress_index: DashMap::new(),
                incoming: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Install a feature: the feature registers its method handlers.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error when a method is registered twice.
    pub fn add_feature(&self, feature: &dyn Feature) -> McpResult<()> {
        let ctx = FeatureContext {
            handlers: &self.inner.handlers,
        };
        feature.initialize(&ctx)?;
        info!(feature = feature.name(), "feature installed");
        Ok(())
    }

    /// Attach a transport. Installs the incoming callback, connects the
    /// transport, and returns the minted connection id.
    pub async fn connect(&self, transport: Arc<dyn ServerTransport>) -> McpResult<ConnectionId> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(McpError::connection_closed("engine is closed"));
        }
        let connection = ConnectionId(
            self.inner
                .config
                .id_generator
                .generate(GenerateOptions::prefix("conn")),
        );

        // The callback holds a weak handle: the engine owns the transport,
        // the transport must not keep the engine alive.
        let weak = Arc::downgrade(&self.inner);
        let conn = connection.clone();
        transport.set_incoming(Arc::new(move |message, ctx, info| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let conn = conn.clone();
            tokio::spawn(async move {
                EngineInner::dispatch(inner, conn, message, ctx, info).await;
            });
        }));

        transport.connect().await?;
        self.inner
            .connections
            .insert(connection.clone(), transport);
        info!(connection = %connection, "transport connected");
        Ok(connection)
    }

    /// Detach a connection: disconnect its transport, reject its pending
    /// requests, trip its incoming aborts.
    pub async fn disconnect(&self, connection: &ConnectionId) -> McpResult<()> {
        let Some((_, transport)) = self.inner.connections.remove(connection) else {
            return Ok(());
        };
        self.inner.reject_connection(connection);
        transport.disconnect().await?;
        info!(connection = %connection, "transport disconnected");
        Ok(())
    }

    /// Send a message on a connection.
    ///
    /// The message type is determined by its method string: a
    /// `notifications/` prefix means fire-and-forget; anything else is a
    /// request and the call resolves with the full response envelope (or
    /// rejects with the error derived from an error envelope, a timeout,
    /// an external abort, or connection close).
    ///
    /// The caller supplies the request id inside the message; the engine
    /// does not mint one here. Use [`ProtocolEngine::request`] for that.
    pub async fn send(
        &self,
        connection: &ConnectionId,
        message: Value,
        options: RequestOptions,
    ) -> McpResult<Option<JsonRpcResponse>> {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_request("outgoing message requires a method"))?
            .to_string();
        let transport = self
            .inner
            .connections
            .get(connection)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                McpError::connection_closed(format!("unknown connection: {connection}"))
            })?;

        if methods::is_notification_method(&method) {
            self.inner.config.hooks.on_before_send_notification(&message);
            transport
                .send(
                    message.clone(),
                    SendOptions {
                        session_id: options.session_id,
                        request_id: None,
                    },
                )
                .await?;
            self.inner.config.hooks.on_after_send_notification(&message);
            return Ok(None);
        }

        let id: RequestId = message
            .get("id")
            .cloned()
            .and_then(|raw| serde_json::from_value(raw).ok())
            .ok_or_else(|| McpError::invalid_request("outgoing request requires an id"))?;
        let key = CorrelationKey {
            connection: connection.clone(),
            session: options.session_id.clone(),
            request: id.clone(),
        };

        // External aborts propagate through a child token
        let abort = options
            .signal
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);

        let progress_token = if options.on_progress.is_some() {
            extract_progress_token(&message)
        } else {
            None
        };

        let (tx, rx) = oneshot::channel();
        let timeout = options
            .timeout
            .unwrap_or(self.inner.config.default_request_timeout);
        let entry = Arc::new(PendingEntry {
            tx: Mutex::new(Some(tx)),
            timeout,
            max_deadline: options
                .max_total_timeout
                .map(|cap| tokio::time::Instant::now() + cap),
            reset_on_progress: options.reset_timeout_on_progress,
            on_progress: options.on_progress.clone(),
            progress_token: progress_token.clone(),
            timeout_task: Mutex::new(None),
        });
        self.inner.pending.insert(key.clone(), Arc::clone(&entry));
        if let Some(token) = progress_token {
            self.inner.progress_index.insert(
                ProgressKey {
                    connection: connection.clone(),
                    session: options.session_id.clone(),
                    token,
                },
                key.clone(),
            );
        }
        EngineInner::arm_timeout(&self.inner, &key, &entry);

        self.inner.config.hooks.on_before_send_request(&message);
        if let Err(err) = transport
            .send(
                message.clone(),
                SendOptions {
                    session_id: options.session_id.clone(),
                    request_id: Some(id),
                },
            )
            .await
        {
            // The request never left; clean up without completing
            self.inner.take_pending(&key);
            return Err(McpError::internal(format!("transport send failed: {err}")));
        }
        self.inner.config.hooks.on_after_send_request(&message);

        tokio::select! {
            res = rx => match res {
                Ok(outcome) => outcome.map(Some),
                Err(_) => Err(McpError::internal("pending request dropped")),
            },
            _ = abort.cancelled() => {
                self.inner.take_pending(&key);
                Err(McpError::internal("Request aborted by external signal"))
            }
        }
    }

    /// Send a request, minting a fresh id via the configured generator.
    pub async fn request(
        &self,
        connection: &ConnectionId,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<JsonRpcResponse> {
        let id = self
            .inner
            .config
            .id_generator
            .generate(GenerateOptions::prefix("req"));
        let mut message = json!({"jsonrpc": "2.0", "id": id, "method": method});
        if let Some(params) = params {
            message["params"] = params;
        }
        self.send(connection, message, options)
            .await?
            .ok_or_else(|| McpError::internal("request produced no response"))
    }

    /// Number of pending outgoing requests, for observability and tests.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close the engine: every pending request rejects with a
    /// connection-closed error, every incoming abort trips, every
    /// connection disconnects, all tables clear.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<CorrelationKey> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some(entry) = self.inner.take_pending(&key) {
                EngineInner::complete(&entry, Err(McpError::connection_closed("engine closed")));
            }
        }

        for entry in self.inner.incoming.iter() {
            entry.value().cancel();
        }
        self.inner.incoming.clear();
        self.inner.progress_index.clear();

        let transports: Vec<Arc<dyn ServerTransport>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.connections.clear();
        for transport in transports {
            if let Err(err) = transport.disconnect().await {
                warn!(error = %err, "transport disconnect failed during close");
            }
        }

        self.inner.config.hooks.on_close();
        info!("engine closed");
    }
}

impl EngineInner {
    /// Entry point for every incoming message.
    async fn dispatch(
        inner: Arc<Self>,
        connection: ConnectionId,
        message: ParsedMessage,
        ctx: MessageContext,
        info: MessageInfo,
    ) {
        inner.config.hooks.on_before_receive(&message, &ctx);
        match &message {
            ParsedMessage::Response(response) => {
                inner.handle_response(&connection, &ctx, response.clone());
            }
            ParsedMessage::Request(request) => {
                Self::process_request(&inner, connection.clone(), request.clone(), &ctx, &info)
                    .await;
            }
            ParsedMessage::Notification(notification) => {
                let notification = notification.clone();
                match notification.method.as_str() {
                    methods::NOTIFICATIONS_CANCELLED => {
                        inner.handle_cancelled(&connection, &ctx, notification.params);
                    }
                    methods::NOTIFICATIONS_PROGRESS => {
                        Self::handle_progress(&inner, &connection, &ctx, notification.params);
                    }
                    other => {
                        Self::dispatch_notification(
                            &inner,
                            &connection,
                            other.to_string(),
                            notification.params,
                            &ctx,
                            &info,
                        )
                        .await;
                    }
                }
            }
        }
        inner.config.hooks.on_after_receive(&message, &ctx);
    }

    /// Responses and errors: correlate, complete, or drop.
    fn handle_response(
        &self,
        connection: &ConnectionId,
        ctx: &MessageContext,
        response: JsonRpcResponse,
    ) {
        let Some(id) = response.request_id().cloned() else {
            debug!("dropping response with null id");
            return;
        };
        let key = CorrelationKey {
            connection: connection.clone(),
            session: ctx.session_id().map(str::to_string),
            request: id,
        };
        match self.take_pending(&key) {
            Some(entry) => {
                let outcome = match &response.payload {
                    JsonRpcResponsePayload::Success { .. } => Ok(response),
                    JsonRpcResponsePayload::Error { error } => Err(McpError::from(error.clone())),
                };
                Self::complete(&entry, outcome);
            }
            None => {
                info!(request = %key.request, "dropping uncorrelated response");
            }
        }
    }

    /// Requests: record the abort handle, run the handler, emit exactly one
    /// envelope - or none when cancelled.
    async fn process_request(
        inner: &Arc<Self>,
        connection: ConnectionId,
        request: JsonRpcRequest,
        ctx: &MessageContext,
        info: &MessageInfo,
    ) {
        let key = CorrelationKey {
            connection: connection.clone(),
            session: ctx.session_id().map(str::to_string),
            request: request.id.clone(),
        };
        let cancel = CancellationToken::new();
        inner.incoming.insert(key.clone(), cancel.clone());

        let result = Self::run_handler(inner, &connection, &request, ctx, info, &cancel).await;

        inner.incoming.remove(&key);

        if cancel.is_cancelled() {
            debug!(method = %request.method, request = %request.id, "request cancelled, suppressing response");
            return;
        }

        let envelope = match result {
            Ok(value) => JsonRpcResponse::success(value, request.id.clone()),
            Err(err) => {
                inner.config.hooks.on_handler_error(&request.method, &err);
                warn!(method = %request.method, error = %err, "request handler failed");
                JsonRpcResponse::error_response(err.to_json_rpc_error(), request.id.clone())
            }
        };

        let Some(transport) = inner
            .connections
            .get(&connection)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(connection = %connection, "connection gone before response emit");
            return;
        };
        let options = SendOptions {
            session_id: ctx.session_id().map(str::to_string),
            request_id: Some(request.id.clone()),
        };
        let message = match serde_json::to_value(&envelope) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "failed to serialize response envelope");
                return;
            }
        };
        if let Err(err) = transport.send(message, options).await {
            error!(method = %request.method, error = %err, "failed to emit response");
        }
    }

    async fn run_handler(
        inner: &Arc<Self>,
        connection: &ConnectionId,
        request: &JsonRpcRequest,
        ctx: &MessageContext,
        info: &MessageInfo,
        cancel: &CancellationToken,
    ) -> McpResult<Value> {
        if let (Some(validator), Some(schema)) = (
            &inner.config.schema_validator,
            &inner.config.message_schema,
        ) {
            let raw = serde_json::to_value(request)
                .map_err(|e| McpError::internal(format!("request reserialization failed: {e}")))?;
            validator.validate(&raw, schema)?;
        }

        let Some(handler) = inner
            .handlers
            .get(&request.method)
            .map(|entry| Arc::clone(entry.value()))
        else {
            // ping is answered even without a registered handler
            if request.method == methods::PING {
                return Ok(json!({}));
            }
            return Err(McpError::method_not_found(&request.method));
        };

        let facade = ProtocolFacade {
            inner: Arc::downgrade(inner),
            connection: connection.clone(),
            session: ctx.session.clone(),
        };
        let handler_ctx = HandlerContext {
            logger: ContextLogger::new(&ctx.instance_id, ctx.session_id()),
            id_generator: Arc::clone(&inner.config.id_generator),
            session: ctx.session.clone(),
            instance_id: ctx.instance_id.clone(),
        };
        let request_info = RequestInfo {
            method: request.method.clone(),
            received_at: info.received_at,
            metadata: info.metadata.clone(),
            cancellation: cancel.child_token(),
        };
        let message = HandlerMessage {
            method: request.method.clone(),
            params: request.params.clone(),
            id: Some(request.id.clone()),
        };

        // Handler panics must not leak the incoming entry or kill the task
        std::panic::AssertUnwindSafe(handler.handle(facade, message, handler_ctx, request_info))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(McpError::internal("handler panicked")))
    }

    /// Plain notifications dispatch through the same handler table; their
    /// results are discarded and they may not reply.
    async fn dispatch_notification(
        inner: &Arc<Self>,
        connection: &ConnectionId,
        method: String,
        params: Option<Value>,
        ctx: &MessageContext,
        info: &MessageInfo,
    ) {
        let Some(handler) = inner
            .handlers
            .get(&method)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(method = %method, "no handler for notification, dropping");
            return;
        };

        let facade = ProtocolFacade {
            inner: Arc::downgrade(inner),
            connection: connection.clone(),
            session: ctx.session.clone(),
        };
        let handler_ctx = HandlerContext {
            logger: ContextLogger::new(&ctx.instance_id, ctx.session_id()),
            id_generator: Arc::clone(&inner.config.id_generator),
            session: ctx.session.clone(),
            instance_id: ctx.instance_id.clone(),
        };
        let request_info = RequestInfo {
            method: method.clone(),
            received_at: info.received_at,
            metadata: info.metadata.clone(),
            cancellation: CancellationToken::new(),
        };
        let message = HandlerMessage {
            method: method.clone(),
            params,
            id: None,
        };

        let outcome =
            std::panic::AssertUnwindSafe(handler.handle(facade, message, handler_ctx, request_info))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(McpError::internal("handler panicked")));
        if let Err(err) = outcome {
            warn!(method = %method, error = %err, "notification handler failed");
        }
    }

    /// `notifications/cancelled`: trip the incoming request's abort handle.
    fn handle_cancelled(
        &self,
        connection: &ConnectionId,
        ctx: &MessageContext,
        params: Option<Value>,
    ) {
        let parsed: CancelledParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(parsed)) => parsed,
            _ => {
                debug!("malformed notifications/cancelled, dropping");
                return;
            }
        };
        let key = CorrelationKey {
            connection: connection.clone(),
            session: ctx.session_id().map(str::to_string),
            request: parsed.request_id.clone(),
        };
        match self.incoming.get(&key) {
            Some(token) => {
                debug!(
                    request = %parsed.request_id,
                    reason = parsed.reason.as_deref().unwrap_or("-"),
                    "cancelling in-flight request"
                );
                token.cancel();
            }
            None => {
                debug!(request = %parsed.request_id, "cancellation for unknown request");
            }
        }
    }

    /// `notifications/progress`: route to the originating pending request.
    fn handle_progress(
        inner: &Arc<Self>,
        connection: &ConnectionId,
        ctx: &MessageContext,
        params: Option<Value>,
    ) {
        let parsed: ProgressParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(parsed)) => parsed,
            _ => {
                debug!("malformed notifications/progress, dropping");
                return;
            }
        };
        let progress_key = ProgressKey {
            connection: connection.clone(),
            session: ctx.session_id().map(str::to_string),
            token: parsed.progress_token.clone(),
        };
        let Some(key) = inner
            .progress_index
            .get(&progress_key)
            .map(|entry| entry.value().clone())
        else {
            debug!(token = %parsed.progress_token, "progress for unknown token");
            return;
        };
        let Some(entry) = inner.pending.get(&key).map(|e| Arc::clone(e.value())) else {
            return;
        };
        if let Some(callback) = &entry.on_progress {
            callback(parsed);
        }
        if entry.reset_on_progress {
            Self::arm_timeout(inner, &key, &entry);
        }
    }

    /// Remove a pending entry, its progress-index entry and its timeout
    /// task. Whoever gets `Some` back owns completion.
    fn take_pending(&self, key: &CorrelationKey) -> Option<Arc<PendingEntry>> {
        let (_, entry) = self.pending.remove(key)?;
        if let Some(token) = &entry.progress_token {
            self.progress_index.remove(&ProgressKey {
                connection: key.connection.clone(),
                session: key.session.clone(),
                token: token.clone(),
            });
        }
        if let Some(task) = entry.timeout_task.lock().take() {
            task.abort();
        }
        Some(entry)
    }

    /// Complete a pending entry exactly once.
    fn complete(entry: &Arc<PendingEntry>, outcome: McpResult<JsonRpcResponse>) {
        if let Some(tx) = entry.tx.lock().take() {
            // The receiver may be gone (abort path); nothing to do then
            let _ = tx.send(outcome);
        }
    }

    /// Arm (or re-arm) the timeout for a pending request.
    fn arm_timeout(inner: &Arc<Self>, key: &CorrelationKey, entry: &Arc<PendingEntry>) {
        let duration = match entry.max_deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                entry.timeout.min(remaining)
            }
            None => entry.timeout,
        };
        let weak = Arc::downgrade(inner);
        let key = key.clone();
        let timeout_ms = entry.timeout.as_millis() as u64;
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Some(entry) = inner.take_pending(&key) {
                warn!(request = %key.request, timeout_ms, "pending request timed out");
                Self::complete(
                    &entry,
                    Err(McpError::timeout("Request timeout").with_data(json!({
                        "requestId": key.request.to_string(),
                        "sessionId": key.session,
                        "ms": timeout_ms,
                    }))),
                );
            }
        });
        let mut slot = entry.timeout_task.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(task);
    }

    /// Reject everything belonging to a connection.
    fn reject_connection(&self, connection: &ConnectionId) {
        let keys: Vec<CorrelationKey> = self
            .pending
            .iter()
            .filter(|entry| &entry.key().connection == connection)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some(entry) = self.take_pending(&key) {
                Self::complete(
                    &entry,
                    Err(McpError::connection_closed("connection closed")),
                );
            }
        }
        let incoming: Vec<CorrelationKey> = self
            .incoming
            .iter()
            .filter(|entry| &entry.key().connection == connection)
            .map(|entry| entry.key().clone())
            .collect();
        for key in incoming {
            if let Some((_, token)) = self.incoming.remove(&key) {
                token.cancel();
            }
        }
    }

    /// Capability gate for server-initiated requests.
    fn check_capabilities(&self, method: &str, session: Option<&Session>) -> McpResult<()> {
        let required = match method {
            methods::SAMPLING_CREATE_MESSAGE => "sampling",
            "roots/list" => "roots",
            "elicitation/create" => "elicitation",
            _ => return Ok(()),
        };
        let negotiated = session
            .and_then(Session::client_capabilities)
            .map(|caps| match required {
                "sampling" => caps.sampling.is_some(),
                "roots" => caps.roots.is_some(),
                _ => caps.elicitation.is_some(),
            })
            .unwrap_or(false);
        if negotiated {
            return Ok(());
        }
        if self.config.enforce_strict_capabilities {
            Err(McpError::invalid_params(format!(
                "client did not negotiate the '{required}' capability required by {method}"
            )))
        } else {
            debug!(method, required, "capability not negotiated, proceeding");
            Ok(())
        }
    }
}

/// Handler-facing view of the engine, scoped to one connection.
#[derive(Clone)]
pub struct ProtocolFacade {
    inner: std::sync::Weak<EngineInner>,
    connection: ConnectionId,
    session: Option<Session>,
}

impl ProtocolFacade {
    /// The connection this facade targets.
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// Send a message on the owning connection. Routing defaults to the
    /// handler's session when none is given.
    pub async fn send(
        &self,
        message: Value,
        mut options: RequestOptions,
    ) -> McpResult<Option<JsonRpcResponse>> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| McpError::connection_closed("engine is gone"))?;
        if let Some(method) = message.get("method").and_then(Value::as_str) {
            inner.check_capabilities(method, self.session.as_ref())?;
        }
        if options.session_id.is_none() {
            options.session_id = self.session.as_ref().map(|s| s.id().to_string());
        }
        ProtocolEngine { inner }
            .send(&self.connection, message, options)
            .await
    }

    /// Ping the peer on the owning connection.
    pub async fn ping(&self) -> McpResult<JsonRpcResponse> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| McpError::connection_closed("engine is gone"))?;
        let options = RequestOptions {
            session_id: self.session.as_ref().map(|s| s.id().to_string()),
            ..RequestOptions::default()
        };
        ProtocolEngine { inner }
            .request(&self.connection, methods::PING, None, options)
            .await
    }
}

fn extract_progress_token(message: &Value) -> Option<ProgressToken> {
    let token = message.get("params")?.get("_meta")?.get("progressToken")?;
    serde_json::from_value(token.clone()).ok()
}

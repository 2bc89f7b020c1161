//! Axum endpoint implementing the Streamable HTTP semantics.
//!
//! One configured path multiplexes three roles: client→server POST,
//! server→client background stream via GET, and session termination via
//! DELETE. Sibling `/health` and `/readiness` paths expose liveness.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use meshmcp_broker::{Delivery, EventId, SubscribeOptions as BrokerSubscribeOptions, Topic, TopicPattern};
use meshmcp_protocol::{
    JsonRpcRequest, JsonRpcResponse, McpError, McpResult, ParsedMessage, RequestId, classify_batch,
};
use meshmcp_server::{RequestMetadata, Session};

use crate::policy::ResponseMode;
use crate::transport::{
    StreamableHttpTransport, SubscriptionGuard, TransportInner, is_response_payload,
};

/// Session header name (canonical casing used on responses).
pub const MCP_SESSION_ID: &str = "Mcp-Session-Id";

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

impl StreamableHttpTransport {
    /// Build the axum router for this transport.
    pub fn router(&self) -> Router {
        let inner = Arc::clone(&self.inner);

        let cors = if inner.http.allowed_origins.is_empty() {
            CorsLayer::permissive()
        } else {
            let origins: Vec<HeaderValue> = inner
                .http
                .allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        };

        let mut router = Router::new()
            .route("/health", get(handle_health))
            .route("/readiness", get(handle_readiness))
            .route(
                &inner.http.endpoint,
                axum::routing::post(handle_mcp_post)
                    .get(handle_mcp_get)
                    .delete(handle_mcp_delete)
                    .options(handle_mcp_options),
            )
            .fallback(handle_not_found)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&inner));

        if let Some(hook) = &inner.http.router_hook {
            router = hook(router);
        }
        router
    }

    /// Bind the configured address and serve until the shutdown token
    /// fires, then drain.
    pub async fn serve(&self) -> McpResult<()> {
        let addr = format!("{}:{}", self.inner.http.host, self.inner.http.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| McpError::transport(format!("failed to bind {addr}: {err}")))?;
        self.serve_on(listener).await
    }

    /// Serve on an existing listener (lets callers bind port 0).
    pub async fn serve_on(&self, listener: TcpListener) -> McpResult<()> {
        let local = listener
            .local_addr()
            .map_err(|err| McpError::transport(format!("listener address: {err}")))?;
        self.inner.listening.store(true, Ordering::Release);
        info!(addr = %local, endpoint = %self.inner.http.endpoint, "streamable HTTP transport listening");

        let shutdown = self.inner.shutdown.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|err| McpError::transport(format!("server error: {err}")));

        self.inner.listening.store(false, Ordering::Release);
        result
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn handle_readiness(State(state): State<Arc<TransportInner>>) -> Response {
    if state.listening.load(Ordering::Acquire) {
        Json(json!({"status": "ready", "listening": true})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "listening": false})),
        )
            .into_response()
    }
}

async fn handle_not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn handle_mcp_options() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// POST: parse, classify, select a response mode, correlate via the broker
/// and answer as JSON or SSE.
async fn handle_mcp_post(
    State(state): State<Arc<TransportInner>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let json_ok = accept_allows(&headers, "application/json");
    let sse_ok = accept_allows(&headers, "text/event-stream");
    if !json_ok && !sse_ok {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    if body.len() > state.config.max_body_size {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let meta = request_metadata(&headers);
    let explicit_id = header_session_id(&headers).or(query.session_id);
    let session = match state.resolve_session(explicit_id.as_deref(), &meta).await {
        Ok(Some(session)) => session,
        Ok(None) => return session_not_found(),
        Err(err) => return internal_error(&err),
    };

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return envelope_response(
                StatusCode::BAD_REQUEST,
                JsonRpcResponse::parse_error(Some(format!("Parse error: {err}"))),
            );
        }
    };
    let was_batch = raw.is_array();
    let messages = match classify_batch(raw) {
        Ok(messages) => messages,
        Err(err) => {
            return envelope_response(
                StatusCode::BAD_REQUEST,
                JsonRpcResponse {
                    jsonrpc: meshmcp_protocol::JsonRpcVersion,
                    payload: meshmcp_protocol::JsonRpcResponsePayload::Error {
                        error: err.to_json_rpc_error(),
                    },
                    id: meshmcp_protocol::ResponseId::null(),
                },
            );
        }
    };

    let requests: Vec<JsonRpcRequest> = messages
        .iter()
        .filter_map(|message| match message {
            ParsedMessage::Request(request) => Some(request.clone()),
            _ => None,
        })
        .collect();

    if requests.is_empty() {
        // Notifications-only fast path: hand everything to the engine,
        // publish for audit/fan-out, acknowledge with 202.
        state.deliver_to_engine(&messages, &session, &headers);
        let audit = Topic::background_outbound(session.id());
        for message in &messages {
            if let Err(err) = state.broker.publish(&audit, message.to_value()).await {
                warn!(error = %err, "audit publish failed");
            }
        }
        return with_session_header(StatusCode::ACCEPTED.into_response(), session.id());
    }

    let mode = (state.config.response_mode_policy)(&messages, Some(&session));
    match mode {
        ResponseMode::Json if !json_ok => return StatusCode::NOT_ACCEPTABLE.into_response(),
        ResponseMode::Sse if !sse_ok => return StatusCode::NOT_ACCEPTABLE.into_response(),
        _ => {}
    }
    debug!(session = session.id(), requests = requests.len(), ?mode, "handling POST");

    // Correlation subscriptions must be live before the engine sees the
    // messages; a fast handler could publish its response first otherwise.
    let mut subscriptions = Vec::with_capacity(requests.len());
    for request in &requests {
        let topic = Topic::request_outbound(session.id(), &request.id.to_string());
        match state
            .open_subscription(&TopicPattern::from(topic), BrokerSubscribeOptions::new())
            .await
        {
            Ok(guard) => subscriptions.push((request.id.clone(), guard)),
            // Guards already opened are dropped here and clean themselves
            Err(err) => return internal_error(&err),
        }
    }

    state.deliver_to_engine(&messages, &session, &headers);

    match mode {
        ResponseMode::Json => respond_json(&state, &session, subscriptions, was_batch).await,
        ResponseMode::Sse => respond_sse(&state, &session, subscriptions),
    }
}

/// JSON mode: await one terminal message per request under a batch-wide
/// deadline; requests still pending at the deadline materialize as
/// "Request timeout" errors with their original ids.
async fn respond_json(
    state: &Arc<TransportInner>,
    session: &Session,
    subscriptions: Vec<(RequestId, SubscriptionGuard)>,
    was_batch: bool,
) -> Response {
    let deadline = tokio::time::Instant::now() + state.config.response_timeout;
    let mut responses = Vec::with_capacity(subscriptions.len());
    let mut finished = Vec::with_capacity(subscriptions.len());

    for (request_id, mut guard) in subscriptions {
        let payload = loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => break None,
                delivery = guard.next() => match delivery {
                    None => break None,
                    Some(delivery) => {
                        delivery.ack().await;
                        if is_response_payload(&delivery.payload) {
                            break Some(delivery.payload);
                        }
                        // Progress and other notifications have no place
                        // in a buffered body
                    }
                }
            }
        };
        responses.push(payload.unwrap_or_else(|| timeout_envelope(&request_id)));
        finished.push(guard);
    }

    for guard in finished {
        guard.finish().await;
    }

    let body = if was_batch {
        Value::Array(responses)
    } else {
        responses.into_iter().next().unwrap_or(Value::Null)
    };
    with_session_header(Json(body).into_response(), session.id())
}

/// SSE mode: forward every delivery on any request's subscription as an
/// event; a terminal payload closes that request's subscription and the
/// stream ends once all of them closed.
fn respond_sse(
    state: &Arc<TransportInner>,
    session: &Session,
    subscriptions: Vec<(RequestId, SubscriptionGuard)>,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<Delivery>(64);
    for (_, guard) in subscriptions {
        tokio::spawn(forward_request_stream(guard, tx.clone()));
    }
    drop(tx);

    let stream = async_stream::stream! {
        while let Some(delivery) = rx.recv().await {
            delivery.ack().await;
            yield Ok::<Event, Infallible>(
                Event::default()
                    .id(delivery.event_id.to_string())
                    .event("message")
                    .data(delivery.payload.to_string()),
            );
        }
    };

    let response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.config.keepalive_interval))
        .into_response();
    let response = with_header(response, header::CACHE_CONTROL.as_str(), "no-cache");
    with_session_header(response, session.id())
}

async fn forward_request_stream(mut guard: SubscriptionGuard, tx: mpsc::Sender<Delivery>) {
    loop {
        match guard.next().await {
            None => break,
            Some(delivery) => {
                let terminal = is_response_payload(&delivery.payload);
                if tx.send(delivery).await.is_err() {
                    // Client gone; stop streaming
                    break;
                }
                if terminal {
                    break;
                }
            }
        }
    }
    guard.finish().await;
}

/// GET: the resumable background channel.
async fn handle_mcp_get(
    State(state): State<Arc<TransportInner>>,
    headers: HeaderMap,
) -> Response {
    if !state.config.enable_background_channel {
        return method_not_allowed("POST, DELETE, OPTIONS");
    }
    if !accept_allows(&headers, "text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let Some(session_id) = header_session_id(&headers) else {
        return missing_session_header();
    };

    let meta = request_metadata(&headers);
    let session = match &state.session_store {
        Some(store) => match store.get(&session_id, &meta).await {
            Ok(Some(session)) => session,
            Ok(None) => return session_not_found(),
            Err(err) => return internal_error(&err),
        },
        None => Session::new(session_id.clone()),
    };

    let mut options = BrokerSubscribeOptions::new();
    if let Some(last) = headers.get(LAST_EVENT_ID).and_then(|v| v.to_str().ok()) {
        options = options.from_event_id(EventId::from(last));
    }

    let outbound = Topic::background_outbound(session.id());
    let inbound = Topic::background_inbound(session.id());
    let sub_out = match state
        .open_subscription(&TopicPattern::from(outbound), options.clone())
        .await
    {
        Ok(guard) => guard,
        Err(err) => return internal_error(&err),
    };
    let sub_in = match state
        .open_subscription(&TopicPattern::from(inbound), options)
        .await
    {
        Ok(guard) => guard,
        Err(err) => return internal_error(&err),
    };

    debug!(session = session.id(), "background channel opened");

    let (tx, mut rx) = mpsc::channel::<Delivery>(64);
    tokio::spawn(forward_background_stream(sub_out, tx.clone()));
    tokio::spawn(forward_background_stream(sub_in, tx));

    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(Event::default().comment("connected to background channel"));
        while let Some(delivery) = rx.recv().await {
            // Ack everything; forward only notifications and
            // server-initiated requests - the background channel never
            // carries responses
            delivery.ack().await;
            if is_response_payload(&delivery.payload) {
                continue;
            }
            yield Ok::<Event, Infallible>(
                Event::default()
                    .id(delivery.event_id.to_string())
                    .event("message")
                    .data(delivery.payload.to_string()),
            );
        }
    };

    let response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.config.keepalive_interval))
        .into_response();
    let response = with_header(response, header::CACHE_CONTROL.as_str(), "no-cache");
    with_session_header(response, session.id())
}

async fn forward_background_stream(mut guard: SubscriptionGuard, tx: mpsc::Sender<Delivery>) {
    loop {
        match guard.next().await {
            // Teardown errors surface as end-of-stream; nothing to report
            None => break,
            Some(delivery) => {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        }
    }
    guard.finish().await;
}

/// DELETE: idempotent session termination.
async fn handle_mcp_delete(
    State(state): State<Arc<TransportInner>>,
    headers: HeaderMap,
) -> Response {
    if !state.config.enable_session_termination {
        return method_not_allowed("POST, GET, OPTIONS");
    }
    let Some(session_id) = header_session_id(&headers) else {
        return missing_session_header();
    };

    if let Some(store) = &state.session_store {
        let meta = request_metadata(&headers);
        // Delete never fails for a missing session
        if let Err(err) = store.delete(&session_id, &meta).await {
            return internal_error(&err);
        }
    }
    info!(session = %session_id, "session terminated");
    with_session_header(StatusCode::NO_CONTENT.into_response(), &session_id)
}

// ---------------------------------------------------------------------
// Helpers

fn accept_allows(headers: &HeaderMap, mime: &str) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        // Absent Accept means the client takes anything
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    let class = mime.split('/').next().unwrap_or("");
    accept.split(',').any(|part| {
        let media = part.split(';').next().unwrap_or("").trim();
        media == mime || media == "*/*" || media == format!("{class}/*")
    })
}

fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    RequestMetadata::from_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    )
}

fn with_header(mut response: Response, name: &str, value: &str) -> Response {
    if let (Ok(name), Ok(value)) = (
        header::HeaderName::try_from(name),
        HeaderValue::from_str(value),
    ) {
        response.headers_mut().insert(name, value);
    }
    response
}

fn with_session_header(response: Response, session_id: &str) -> Response {
    with_header(response, MCP_SESSION_ID, session_id)
}

fn envelope_response(status: StatusCode, envelope: JsonRpcResponse) -> Response {
    (status, Json(envelope)).into_response()
}

fn timeout_envelope(request_id: &RequestId) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "error": {"code": -32603, "message": "Request timeout"}
    })
}

fn session_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {"code": -32602, "message": "Session Not Found"},
            "id": null
        })),
    )
        .into_response()
}

fn missing_session_header() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {"code": -32600, "message": "Mcp-Session-Id header is required"},
            "id": null
        })),
    )
        .into_response()
}

fn method_not_allowed(allow: &str) -> Response {
    let response = StatusCode::METHOD_NOT_ALLOWED.into_response();
    with_header(response, header::ALLOW.as_str(), allow)
}

fn internal_error(err: &McpError) -> Response {
    warn!(error = %err, "request failed internally");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {"code": -32603, "message": err.message.clone()},
            "id": null
        })),
    )
        .into_response()
}

//! The Streamable HTTP transport object.
//!
//! One instance owns the broker handle, the optional session store, the
//! active-subscriptions set and the engine-installed incoming callback.
//! The axum handlers in [`crate::http`] run against this state; the engine
//! talks to it through the [`ServerTransport`] seam.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use meshmcp_broker::{
    Broker, Delivery, SubscribeOptions as BrokerSubscribeOptions, Subscription, Topic,
    TopicPattern,
};
use meshmcp_protocol::{McpError, McpResult, ParsedMessage, classify};
use meshmcp_server::{
    IncomingCallback, MessageContext, MessageInfo, RequestMetadata, SendOptions, ServerTransport,
    Session, SessionStore,
};

use crate::config::{HttpServerConfig, StreamableConfig};

/// Hook invoked exactly once when the transport disconnects.
pub type OnCloseHook = Box<dyn FnOnce() + Send>;

pub(crate) struct TransportInner {
    pub(crate) config: StreamableConfig,
    pub(crate) http: HttpServerConfig,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) session_store: Option<Arc<dyn SessionStore>>,
    pub(crate) incoming: RwLock<Option<IncomingCallback>>,
    pub(crate) active_subs: DashMap<u64, CancellationToken>,
    pub(crate) next_sub_id: AtomicU64,
    pub(crate) listening: AtomicBool,
    pub(crate) instance_id: String,
    pub(crate) shutdown: CancellationToken,
    on_close: Mutex<Option<OnCloseHook>>,
}

/// The Streamable HTTP transport.
///
/// Cheap to clone; clones share state. Create one, attach it to a
/// [`ProtocolEngine`](meshmcp_server::ProtocolEngine) via `connect`, then
/// drive it with [`serve`](crate::http::serve) or mount
/// [`router`](crate::http::router) into an existing axum app.
#[derive(Clone)]
pub struct StreamableHttpTransport {
    pub(crate) inner: Arc<TransportInner>,
}

impl StreamableHttpTransport {
    /// Create a transport over a broker, with no session store (stateless
    /// mode: session ids are minted per POST and never retrievable later).
    pub fn new(broker: Arc<dyn Broker>, config: StreamableConfig, http: HttpServerConfig) -> Self {
        Self::with_session_store_opt(broker, config, http, None)
    }

    /// Create a transport with a session store.
    pub fn with_session_store(
        broker: Arc<dyn Broker>,
        config: StreamableConfig,
        http: HttpServerConfig,
        session_store: Arc<dyn SessionStore>,
    ) -> Self {
        Self::with_session_store_opt(broker, config, http, Some(session_store))
    }

    fn with_session_store_opt(
        broker: Arc<dyn Broker>,
        config: StreamableConfig,
        http: HttpServerConfig,
        session_store: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                config,
                http,
                broker,
                session_store,
                incoming: RwLock::new(None),
                active_subs: DashMap::new(),
                next_sub_id: AtomicU64::new(0),
                listening: AtomicBool::new(false),
                instance_id: format!("streamable-http-{}", Uuid::new_v4().simple()),
                shutdown: CancellationToken::new(),
                on_close: Mutex::new(None),
            }),
        }
    }

    /// Register the hook invoked when the transport disconnects.
    pub fn set_on_close(&self, hook: OnCloseHook) {
        *self.inner.on_close.lock() = Some(hook);
    }

    /// Token cancelled when the transport shuts down; `serve` uses it for
    /// graceful drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Instance tag carried in every message context.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Number of currently open broker subscriptions.
    pub fn active_subscription_count(&self) -> usize {
        self.inner.active_subs.len()
    }
}

#[async_trait]
impl ServerTransport for StreamableHttpTransport {
    fn set_incoming(&self, callback: IncomingCallback) {
        *self.inner.incoming.write() = Some(callback);
    }

    async fn connect(&self) -> McpResult<()> {
        debug!(instance = %self.inner.instance_id, "transport connected to engine");
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        // Unsubscribe every active subscription, stop the HTTP server,
        // fire the close hook exactly once.
        for entry in self.inner.active_subs.iter() {
            entry.value().cancel();
        }
        self.inner.active_subs.clear();
        self.inner.shutdown.cancel();
        if let Some(hook) = self.inner.on_close.lock().take() {
            hook();
        }
        debug!(instance = %self.inner.instance_id, "transport disconnected");
        Ok(())
    }

    async fn send(&self, message: Value, options: SendOptions) -> McpResult<()> {
        let Some(session_id) = options.session_id else {
            return Err(McpError::configuration(
                "streamable transport send requires a session id",
            ));
        };

        let topic = match options.request_id {
            Some(request_id) => Topic::request_outbound(&session_id, &request_id.to_string()),
            None => match classify(message.clone()) {
                // Server-initiated requests travel to the client on the
                // background-inbound subject; notifications and responses
                // on background-outbound.
                Ok(ParsedMessage::Request(_)) => Topic::background_inbound(&session_id),
                _ => Topic::background_outbound(&session_id),
            },
        };

        self.inner
            .broker
            .publish(&topic, message)
            .await
            .map_err(|err| McpError::transport(format!("broker publish failed: {err}")))?;
        Ok(())
    }
}

impl TransportInner {
    /// Resolve the POST/GET session per the header / query / store rules.
    /// `explicit_id` is the id the client supplied, if any.
    pub(crate) async fn resolve_session(
        &self,
        explicit_id: Option<&str>,
        meta: &RequestMetadata,
    ) -> McpResult<Option<Session>> {
        match (explicit_id, &self.session_store) {
            (Some(id), Some(store)) => store.get(id, meta).await,
            // No store: synthesize an id-only session so handlers can
            // still discriminate connections
            (Some(id), None) => Ok(Some(Session::new(id))),
            (None, Some(store)) => store.create(meta).await.map(Some),
            (None, None) => Ok(Some(Session::ephemeral())),
        }
    }

    /// Hand messages to the engine through the installed callback.
    pub(crate) fn deliver_to_engine(
        &self,
        messages: &[ParsedMessage],
        session: &Session,
        headers: &HeaderMap,
    ) {
        let Some(callback) = self.incoming.read().clone() else {
            warn!("no engine attached, dropping inbound messages");
            return;
        };
        let metadata: std::collections::HashMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        for message in messages {
            callback(
                message.clone(),
                MessageContext {
                    instance_id: self.instance_id.clone(),
                    session: Some(session.clone()),
                },
                MessageInfo {
                    received_at: Utc::now(),
                    metadata: metadata.clone(),
                },
            );
        }
    }

    /// Open a correlation subscription wrapped in its cleanup guard.
    pub(crate) async fn open_subscription(
        self: &Arc<Self>,
        pattern: &TopicPattern,
        options: BrokerSubscribeOptions,
    ) -> McpResult<SubscriptionGuard> {
        let mut sub = self
            .broker
            .subscribe(pattern, options)
            .await
            .map_err(|err| McpError::transport(format!("broker subscribe failed: {err}")))?;
        // Must be live before any triggering message is processed,
        // otherwise a fast response can be published before we listen.
        sub.ready()
            .await
            .map_err(|err| McpError::transport(format!("subscription ready failed: {err}")))?;

        let id = self.next_sub_id.fetch_add(1, Ordering::AcqRel);
        let token = CancellationToken::new();
        self.active_subs.insert(id, token.clone());
        Ok(SubscriptionGuard {
            id,
            inner: Arc::clone(self),
            sub: Some(sub),
            token,
        })
    }
}

/// A broker subscription tied to the transport's active set.
///
/// Every exit path of a POST or GET - normal completion, timeout, client
/// disconnect, panic - runs this guard's `Drop`, which removes the entry
/// from the active set and finishes the unsubscribe on a spawned task.
pub(crate) struct SubscriptionGuard {
    id: u64,
    inner: Arc<TransportInner>,
    sub: Option<Box<dyn Subscription>>,
    pub(crate) token: CancellationToken,
}

impl SubscriptionGuard {
    /// Await the next delivery, bailing out when the transport shuts this
    /// subscription down.
    pub(crate) async fn next(&mut self) -> Option<Delivery> {
        let sub = self.sub.as_mut()?;
        tokio::select! {
            () = self.token.cancelled() => None,
            delivery = sub.next() => delivery,
        }
    }

    /// Explicit teardown on the normal path.
    pub(crate) async fn finish(mut self) {
        self.inner.active_subs.remove(&self.id);
        if let Some(mut sub) = self.sub.take() {
            sub.unsubscribe().await;
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.inner.active_subs.remove(&self.id);
        if let Some(mut sub) = self.sub.take() {
            // Unsubscribe is async; finish it out of band. Outside a
            // runtime (test teardown) the subscription's own Drop is the
            // backstop.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    sub.unsubscribe().await;
                });
            }
        }
    }
}

/// Whether a raw payload is a response or error envelope.
pub(crate) fn is_response_payload(payload: &Value) -> bool {
    payload.is_object() && (payload.get("result").is_some() || payload.get("error").is_some())
}

//! Session management.
//!
//! A session is the server-side object carrying key/value state and MCP
//! negotiation metadata across HTTP requests from a single client. Sessions
//! share interior state: cloning a [`Session`] yields another view onto the
//! same bag and state tag, so per-key mutations are atomic and visible to
//! every holder.
//!
//! The state tag only moves forward: created → initialized → expired or
//! deleted. Backwards transitions are silently refused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use meshmcp_protocol::{ClientCapabilities, Implementation, McpResult};

/// Bag keys the typed views read.
pub mod keys {
    /// Negotiated protocol version
    pub const PROTOCOL_VERSION: &str = "protocolVersion";
    /// Client implementation info
    pub const CLIENT_INFO: &str = "clientInfo";
    /// Client capabilities
    pub const CLIENT_CAPABILITIES: &str = "clientCapabilities";
    /// Server implementation info
    pub const SERVER_INFO: &str = "serverInfo";
    /// Server capabilities
    pub const SERVER_CAPABILITIES: &str = "serverCapabilities";
}

/// Lifecycle state of a session. Transitions are forward-only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Session exists but the MCP handshake has not completed
    #[default]
    Created,
    /// `initialize` has been answered and acknowledged
    Initialized,
    /// Session aged out
    Expired,
    /// Client terminated the session
    Deleted,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Initialized => 1,
            Self::Expired | Self::Deleted => 2,
        }
    }
}

struct SessionInner {
    id: String,
    state: RwLock<SessionState>,
    values: DashMap<String, Value>,
    created_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
    expired_at: RwLock<Option<DateTime<Utc>>>,
    deleted_at: RwLock<Option<DateTime<Utc>>>,
    last_activity: RwLock<DateTime<Utc>>,
}

/// A session handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                state: RwLock::new(SessionState::Created),
                values: DashMap::new(),
                created_at: now,
                updated_at: RwLock::new(now),
                expired_at: RwLock::new(None),
                deleted_at: RwLock::new(None),
                last_activity: RwLock::new(now),
            }),
        }
    }

    /// Create a session with a random UUID id (stateless transport mode).
    pub fn ephemeral() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// The immutable session id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current state tag.
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Last mutation timestamp.
    pub fn updated_at(&self) -> DateTime<Utc> {
        *self.inner.updated_at.read()
    }

    /// Attempt a forward state transition. Backwards moves are refused and
    /// return false.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.inner.state.write();
        if next.rank() <= state.rank() && next != *state {
            debug!(session = %self.inner.id, from = ?*state, to = ?next, "refusing backwards session transition");
            return false;
        }
        if *state == next {
            return true;
        }
        *state = next;
        let now = Utc::now();
        *self.inner.updated_at.write() = now;
        match next {
            SessionState::Expired => *self.inner.expired_at.write() = Some(now),
            SessionState::Deleted => *self.inner.deleted_at.write() = Some(now),
            _ => {}
        }
        true
    }

    /// Whether the session can serve traffic.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Created | SessionState::Initialized
        )
    }

    /// Read a bag value.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.touch();
        self.inner.values.get(key).map(|entry| entry.value().clone())
    }

    /// Write a bag value. Atomic per key.
    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        self.inner.values.insert(key.into(), value);
        let now = Utc::now();
        *self.inner.updated_at.write() = now;
        *self.inner.last_activity.write() = now;
    }

    /// Refresh the activity clock.
    pub fn touch(&self) {
        *self.inner.last_activity.write() = Utc::now();
    }

    /// Whether the session has been idle longer than `timeout`.
    pub fn idle_longer_than(&self, timeout: Duration) -> bool {
        let last = *self.inner.last_activity.read();
        Utc::now().signed_duration_since(last).to_std().map_or(false, |idle| idle > timeout)
    }

    // Typed views. Adaptation is lazy: each read projects the bag value it
    // needs instead of materializing a typed record up front.

    /// Negotiated protocol version, if the handshake happened.
    pub fn protocol_version(&self) -> Option<String> {
        self.get_value(keys::PROTOCOL_VERSION)
            .and_then(|v| v.as_str().map(String::from))
    }

    /// Client implementation info.
    pub fn client_info(&self) -> Option<Implementation> {
        self.get_value(keys::CLIENT_INFO)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Client capabilities negotiated at initialize.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.get_value(keys::CLIENT_CAPABILITIES)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Server implementation info recorded at initialize.
    pub fn server_info(&self) -> Option<Implementation> {
        self.get_value(keys::SERVER_INFO)
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("keys", &self.inner.values.len())
            .finish()
    }
}

/// Opaque request metadata handed to the store.
///
/// Carries the current HTTP request's headers for stores that bind sessions
/// to cookies, IPs or tokens; the engine never looks inside.
#[derive(Clone, Debug, Default)]
pub struct RequestMetadata {
    headers: HashMap<String, String>,
}

impl RequestMetadata {
    /// Empty metadata (non-HTTP callers, tests).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from header name/value pairs. Names are lowercased.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.as_ref().to_string()))
                .collect(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Pluggable session storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session.
    async fn create(&self, meta: &RequestMetadata) -> McpResult<Session>;

    /// Resolve a session by id. Expired and deleted sessions resolve to
    /// `None`.
    async fn get(&self, id: &str, meta: &RequestMetadata) -> McpResult<Option<Session>>;

    /// Delete a session. Idempotent: deleting an unknown id succeeds.
    async fn delete(&self, id: &str, meta: &RequestMetadata) -> McpResult<()>;
}

/// In-memory [`SessionStore`] with optional idle expiry.
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    idle_timeout: Option<Duration>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemorySessionStore {
    /// Create a store; sessions idle longer than `idle_timeout` expire.
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Expire and drop idle sessions. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_longer_than(timeout))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            if let Some((_, session)) = self.sessions.remove(id) {
                session.transition(SessionState::Expired);
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "expired idle sessions");
        }
        stale.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, _meta: &RequestMetadata) -> McpResult<Session> {
        let session = Session::ephemeral();
        self.sessions
            .insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str, _meta: &RequestMetadata) -> McpResult<Option<Session>> {
        match self.sessions.get(id) {
            Some(entry) => {
                let session = entry.value().clone();
                drop(entry);
                if let Some(timeout) = self.idle_timeout
                    && session.idle_longer_than(timeout)
                {
                    self.sessions.remove(id);
                    session.transition(SessionState::Expired);
                    return Ok(None);
                }
                if !session.is_live() {
                    return Ok(None);
                }
                session.touch();
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str, _meta: &RequestMetadata) -> McpResult<()> {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.transition(SessionState::Deleted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_transitions_forward_only() {
        let session = Session::new("s1");
        assert_eq!(session.state(), SessionState::Created);

        assert!(session.transition(SessionState::Initialized));
        assert_eq!(session.state(), SessionState::Initialized);

        // Backwards is refused
        assert!(!session.transition(SessionState::Created));
        assert_eq!(session.state(), SessionState::Initialized);

        assert!(session.transition(SessionState::Deleted));
        assert!(!session.is_live());
        assert!(!session.transition(SessionState::Initialized));
    }

    #[test]
    fn test_bag_shared_across_clones() {
        let session = Session::new("s1");
        let view = session.clone();
        session.set_value("k", json!(1));
        assert_eq!(view.get_value("k"), Some(json!(1)));
    }

    #[test]
    fn test_lazy_typed_views() {
        let session = Session::new("s1");
        assert!(session.protocol_version().is_none());
        assert!(session.client_info().is_none());

        session.set_value(keys::PROTOCOL_VERSION, json!("2025-11-25"));
        session.set_value(keys::CLIENT_INFO, json!({"name": "c", "version": "1"}));

        assert_eq!(session.protocol_version().as_deref(), Some("2025-11-25"));
        assert_eq!(session.client_info().unwrap().name, "c");
    }

    #[tokio::test]
    async fn test_store_crud() {
        let store = MemorySessionStore::default();
        let meta = RequestMetadata::empty();

        let session = store.create(&meta).await.unwrap();
        let id = session.id().to_string();

        let fetched = store.get(&id, &meta).await.unwrap().unwrap();
        assert_eq!(fetched.id(), id);

        store.delete(&id, &meta).await.unwrap();
        assert!(store.get(&id, &meta).await.unwrap().is_none());
        assert_eq!(session.state(), SessionState::Deleted);

        // Idempotent delete
        store.delete(&id, &meta).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_idle_expiry() {
        let store = MemorySessionStore::new(Some(Duration::from_millis(0)));
        let meta = RequestMetadata::empty();
        let session = store.create(&meta).await.unwrap();
        let id = session.id().to_string();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get(&id, &meta).await.unwrap().is_none());
        assert_eq!(session.state(), SessionState::Expired);
    }

    #[test]
    fn test_request_metadata_case_insensitive() {
        let meta = RequestMetadata::from_headers([("Mcp-Session-Id", "abc")]);
        assert_eq!(meta.header("mcp-session-id"), Some("abc"));
        assert_eq!(meta.header("MCP-SESSION-ID"), Some("abc"));
        assert_eq!(meta.header("other"), None);
    }
}

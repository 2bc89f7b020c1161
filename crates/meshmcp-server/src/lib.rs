//! # meshmcp-server
//!
//! The transport-agnostic MCP protocol engine.
//!
//! [`ProtocolEngine`] manages any number of attached transports
//! ([`ServerTransport`]), correlates outgoing requests with incoming
//! responses keyed by `(connection, session, request-id)`, dispatches
//! incoming requests and notifications to handlers registered by
//! [`Feature`]s, handles `notifications/cancelled` and
//! `notifications/progress`, enforces per-request timeouts, and tears
//! everything down deterministically on [`ProtocolEngine::close`].
//!
//! The crate also owns the session model ([`Session`], [`SessionStore`]):
//! an opaque-id object carrying key/value state and MCP negotiation
//! metadata across requests.

pub mod config;
pub mod context;
pub mod engine;
pub mod feature;
pub mod handler;
pub mod hooks;
pub mod session;
pub mod transport;

pub use config::{EngineConfig, SchemaValidator};
pub use context::{ContextLogger, GenerateOptions, IdGenerator, UuidGenerator};
pub use engine::{ConnectionId, ProgressCallback, ProtocolEngine, ProtocolFacade, RequestOptions};
pub use feature::{Feature, FeatureContext};
pub use handler::{FnHandler, HandlerContext, HandlerMessage, MethodHandler, RequestInfo};
pub use hooks::{EngineHooks, NoopHooks};
pub use session::{
    MemorySessionStore, RequestMetadata, Session, SessionState, SessionStore, keys,
};
pub use transport::{IncomingCallback, MessageContext, MessageInfo, SendOptions, ServerTransport};

//! # meshmcp-transport-streamable
//!
//! The Streamable HTTP transport: a single endpoint multiplexing
//! client→server POST, a server→client background stream via GET, and
//! session termination via DELETE.
//!
//! Every message is routed through the broker keyed by session, which is
//! what lets the deployment scale horizontally: the instance that answers
//! a request need not be the one holding the client's HTTP connection.
//!
//! The load-bearing pieces:
//!
//! - **Response-mode selection**: each POST carrying requests is answered
//!   either as buffered JSON or as an event stream, chosen by an
//!   overridable [`policy`](crate::policy).
//! - **Correlation**: for every request the transport subscribes to the
//!   request-scoped response subject *before* the engine sees the message,
//!   so a fast response cannot be lost.
//! - **Resumption**: the GET channel honors `Last-Event-ID` by replaying
//!   broker history, given a backend that retains it.

pub mod config;
pub mod http;
pub mod policy;

mod transport;

pub use config::{HttpServerConfig, StreamableConfig};
pub use http::MCP_SESSION_ID;
pub use policy::{ResponseMode, ResponseModePolicy, default_policy, default_response_mode};
pub use transport::{OnCloseHook, StreamableHttpTransport};

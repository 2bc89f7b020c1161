//! # meshmcp-protocol
//!
//! JSON-RPC 2.0 message types and MCP protocol vocabulary shared by the
//! engine and the transports.
//!
//! This crate is pure data: no I/O, no runtime. It provides:
//!
//! - JSON-RPC envelopes ([`JsonRpcRequest`], [`JsonRpcResponse`],
//!   [`JsonRpcNotification`]) with strict version validation
//! - Message classification ([`ParsedMessage`]) used by transports to decide
//!   how to route raw JSON
//! - The MCP handshake types (initialize request/result, capabilities)
//! - The protocol error taxonomy ([`McpError`]) with JSON-RPC code mapping

pub mod error;
pub mod jsonrpc;
pub mod message;
pub mod methods;
pub mod types;

pub use error::{ErrorKind, McpError, McpResult};
pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcErrorCode, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion, RequestId, ResponseId,
};
pub use message::{ParsedMessage, ProgressToken, classify, classify_batch, progress_token_of};
pub use types::{
    CancelledParams, ClientCapabilities, Implementation, InitializeRequest, InitializeResult,
    ProgressParams, SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities, latest_protocol_version,
    negotiate_protocol_version,
};

//! Protocol error taxonomy.
//!
//! Every user-visible failure becomes a JSON-RPC error envelope; [`McpError`]
//! is the internal currency that knows how to map itself onto the wire codes.

use serde_json::Value;

use crate::jsonrpc::{JsonRpcError, JsonRpcErrorCode};

/// Result type for protocol operations
pub type McpResult<T> = Result<T, McpError>;

/// Error categories recognized by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed inbound JSON
    ParseError,
    /// Shape violations (not a valid JSON-RPC message)
    InvalidRequest,
    /// No handler registered for the method
    MethodNotFound,
    /// Bad parameters
    InvalidParams,
    /// Catch-all, including handler exceptions
    Internal,
    /// A pending request saw no response in time
    Timeout,
    /// The connection closed while a request was pending
    ConnectionClosed,
    /// Session id did not resolve to a live session
    SessionNotFound,
    /// Session exists but is past its lifetime
    SessionExpired,
    /// A user handler failed
    Handler,
    /// Transport-level failure (connect, send)
    Transport,
    /// Invalid engine or transport configuration
    Configuration,
    /// Request was cancelled before completion
    Cancelled,
}

impl ErrorKind {
    /// Map the kind onto its JSON-RPC error code.
    ///
    /// Timeouts, handler failures, transport failures, cancellations and
    /// connection teardown all surface as internal errors; session errors
    /// surface as invalid-params since the bad session id is effectively a
    /// bad parameter.
    pub fn jsonrpc_code(self) -> i32 {
        match self {
            Self::ParseError => JsonRpcErrorCode::ParseError.code(),
            Self::InvalidRequest => JsonRpcErrorCode::InvalidRequest.code(),
            Self::MethodNotFound => JsonRpcErrorCode::MethodNotFound.code(),
            Self::InvalidParams | Self::SessionNotFound | Self::SessionExpired => {
                JsonRpcErrorCode::InvalidParams.code()
            }
            Self::Internal
            | Self::Timeout
            | Self::ConnectionClosed
            | Self::Handler
            | Self::Transport
            | Self::Configuration
            | Self::Cancelled => JsonRpcErrorCode::InternalError.code(),
        }
    }
}

/// Protocol error with kind, message and optional structured data.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct McpError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Optional structured payload carried into the JSON-RPC `data` field
    pub data: Option<Value>,
}

impl McpError {
    /// Create an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse error from bad inbound JSON.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    /// Shape violation.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// No handler for the method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("Method not found: {method}"),
        )
    }

    /// Bad parameters.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    /// Catch-all internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// A pending request timed out.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// The connection closed with the request still pending.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionClosed, message)
    }

    /// Session id did not resolve.
    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("Session not found: {session_id}"),
        )
    }

    /// A user handler failed.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, message)
    }

    /// Transport-level failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Invalid configuration.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Request cancelled before completion.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// The JSON-RPC code for this error.
    pub fn jsonrpc_code(&self) -> i32 {
        self.kind.jsonrpc_code()
    }

    /// Convert into the wire error object.
    pub fn to_json_rpc_error(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.jsonrpc_code(),
            message: self.message.clone(),
            data: self.data.clone(),
        }
    }

}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}

/// Build an [`McpError`] from a wire error object received from a peer.
impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        let kind = match err.code {
            -32700 => ErrorKind::ParseError,
            -32600 => ErrorKind::InvalidRequest,
            -32601 => ErrorKind::MethodNotFound,
            -32602 => ErrorKind::InvalidParams,
            _ => ErrorKind::Internal,
        };
        let mut e = Self::new(kind, err.message);
        e.data = err.data;
        e
    }
}

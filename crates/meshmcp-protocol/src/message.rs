//! Message classification.
//!
//! Transports receive raw JSON and must decide whether each value is a
//! request, a notification, or a response before anything else can happen.
//! The rules:
//!
//! - `id` + `method` present: request
//! - `method` present, no `id`: notification
//! - `id` present with `result` or `error`: response
//! - anything else: invalid request

use serde_json::Value;

use crate::error::{McpError, McpResult};
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

/// Progress token attached via `params._meta.progressToken`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// String token
    String(String),
    /// Numeric token
    Number(i64),
}

impl std::fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A classified JSON-RPC message.
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    /// A request expecting a correlated response
    Request(JsonRpcRequest),
    /// A fire-and-forget notification
    Notification(JsonRpcNotification),
    /// A response to an earlier request
    Response(JsonRpcResponse),
}

impl ParsedMessage {
    /// The method name, if this is a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// The request id, if this is a request.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => r.request_id(),
            Self::Notification(_) => None,
        }
    }

    /// Whether this message is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Whether this message carries a response or error payload.
    ///
    /// The background channel uses this to filter out messages that are
    /// reserved for request-scoped delivery.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    /// Serialize back to the wire value.
    pub fn to_value(&self) -> Value {
        match self {
            // Envelope types only contain JSON-representable data, so
            // serialization cannot fail.
            Self::Request(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Self::Notification(n) => serde_json::to_value(n).unwrap_or(Value::Null),
            Self::Response(r) => serde_json::to_value(r).unwrap_or(Value::Null),
        }
    }
}

/// Classify a single raw JSON value.
pub fn classify(value: Value) -> McpResult<ParsedMessage> {
    let obj = value
        .as_object()
        .ok_or_else(|| McpError::invalid_request("message is not a JSON object"))?;

    let has_method = obj.get("method").and_then(Value::as_str).is_some();
    let has_id = obj.contains_key("id") && !obj["id"].is_null();
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if has_method && has_id {
        let request: JsonRpcRequest = serde_json::from_value(value)
            .map_err(|e| McpError::invalid_request(format!("malformed request: {e}")))?;
        Ok(ParsedMessage::Request(request))
    } else if has_method {
        let notification: JsonRpcNotification = serde_json::from_value(value)
            .map_err(|e| McpError::invalid_request(format!("malformed notification: {e}")))?;
        Ok(ParsedMessage::Notification(notification))
    } else if has_result || has_error {
        let response: JsonRpcResponse = serde_json::from_value(value)
            .map_err(|e| McpError::invalid_request(format!("malformed response: {e}")))?;
        Ok(ParsedMessage::Response(response))
    } else {
        Err(McpError::invalid_request(
            "message is neither request, notification nor response",
        ))
    }
}

/// Classify a POST body: a single message or a non-empty batch.
///
/// An empty array is not a valid JSON-RPC batch.
pub fn classify_batch(value: Value) -> McpResult<Vec<ParsedMessage>> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(McpError::invalid_request("empty batch"));
            }
            items.into_iter().map(classify).collect()
        }
        other => Ok(vec![classify(other)?]),
    }
}

/// Extract `params._meta.progressToken` from a request, if present and
/// of a legal shape (string or number).
pub fn progress_token_of(request: &JsonRpcRequest) -> Option<ProgressToken> {
    let token = request.params.as_ref()?.get("_meta")?.get("progressToken")?;
    match token {
        Value::String(s) => Some(ProgressToken::String(s.clone())),
        Value::Number(n) => n.as_i64().map(ProgressToken::Number),
        _ => None,
    }
}

//! MCP handshake and control-flow types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::RequestId;
use crate::message::ProgressToken;

/// Protocol versions this implementation knows, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-11-25", "2025-06-18", "2024-11-05"];

/// The newest protocol version this implementation supports.
pub fn latest_protocol_version() -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS[0]
}

/// Negotiate a protocol version: accept the client's when supported,
/// otherwise answer with the latest supported version.
pub fn negotiate_protocol_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or_else(latest_protocol_version)
}

/// Implementation info (client or server side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name
    pub name: String,
    /// Implementation version
    pub version: String,
}

/// Client capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Sampling support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    /// Roots support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
    /// Elicitation support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Value>,
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Server capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tools support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    /// Prompts support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    /// Resources support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    /// Logging support
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Initialize request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    /// Protocol version requested by the client
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client capabilities
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    /// Client implementation info
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

/// Initialize result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Negotiated protocol version
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities
    pub capabilities: ServerCapabilities,
    /// Server implementation info
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
    /// Additional instructions for the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Parameters of `notifications/cancelled`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    /// Id of the request being cancelled
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    /// Optional human-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Parameters of `notifications/progress`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressParams {
    /// Token that routes this update back to the originating request
    #[serde(rename = "progressToken")]
    pub progress_token: ProgressToken,
    /// Progress so far
    pub progress: f64,
    /// Total amount of work, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Optional status message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_protocol_version("2025-11-25"), "2025-11-25");
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
        // Unknown versions fall back to the latest, not an error
        assert_eq!(
            negotiate_protocol_version("2020-01-01"),
            latest_protocol_version()
        );
    }

    #[test]
    fn test_initialize_request_wire_shape() {
        let req: InitializeRequest = serde_json::from_value(json!({
            "protocolVersion": "2025-11-25",
            "capabilities": {},
            "clientInfo": {"name": "c", "version": "1"}
        }))
        .unwrap();
        assert_eq!(req.client_info.name, "c");
        assert_eq!(req.capabilities, ClientCapabilities::default());
    }

    #[test]
    fn test_initialize_result_wire_shape() {
        let result = InitializeResult {
            protocol_version: "2025-11-25".into(),
            capabilities: ServerCapabilities::default(),
            server_info: Implementation {
                name: "mcp-example-server".into(),
                version: "0.1.0".into(),
            },
            instructions: None,
        };
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["protocolVersion"], "2025-11-25");
        assert_eq!(wire["serverInfo"]["name"], "mcp-example-server");
        assert_eq!(wire["capabilities"], json!({}));
        assert!(wire.get("instructions").is_none());
    }

    #[test]
    fn test_cancelled_params() {
        let params: CancelledParams =
            serde_json::from_value(json!({"requestId": 3, "reason": "user"})).unwrap();
        assert_eq!(params.request_id, RequestId::Number(3));
        assert_eq!(params.reason.as_deref(), Some("user"));
    }
}

//! Example features: the MCP handshake and an echo tool.

use std::sync::Arc;

use dashmap::DashSet;
use serde_json::{Value, json};
use tracing::info;

use meshmcp_protocol::{
    Implementation, InitializeRequest, InitializeResult, McpError, McpResult, ServerCapabilities,
    methods, negotiate_protocol_version,
};
use meshmcp_server::{Feature, FeatureContext, FnHandler, Session, SessionState, keys};

/// Callback fired once per session when the client confirms initialization.
pub type OnReady = Arc<dyn Fn(&str) + Send + Sync>;

/// Handshake feature: answers `initialize`, records the negotiated
/// metadata on the session, and fires the ready callback on the first
/// `notifications/initialized` for each session.
pub struct InitializeFeature {
    server_info: Implementation,
    on_ready: Option<OnReady>,
    ready_sessions: Arc<DashSet<String>>,
}

impl InitializeFeature {
    /// Feature announcing the given server identity.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            on_ready: None,
            ready_sessions: Arc::new(DashSet::new()),
        }
    }

    /// Fire `on_ready` once per session after the initialized notification.
    pub fn with_on_ready(mut self, on_ready: OnReady) -> Self {
        self.on_ready = Some(on_ready);
        self
    }
}

/// Build the initialize result and record negotiation metadata on the
/// session bag.
fn perform_initialize(
    request: &InitializeRequest,
    server_info: &Implementation,
    session: Option<&Session>,
) -> InitializeResult {
    let negotiated = negotiate_protocol_version(&request.protocol_version);
    if let Some(session) = session {
        session.set_value(keys::PROTOCOL_VERSION, json!(negotiated));
        session.set_value(
            keys::CLIENT_INFO,
            serde_json::to_value(&request.client_info).unwrap_or(Value::Null),
        );
        session.set_value(
            keys::CLIENT_CAPABILITIES,
            serde_json::to_value(&request.capabilities).unwrap_or(Value::Null),
        );
        session.set_value(
            keys::SERVER_INFO,
            serde_json::to_value(server_info).unwrap_or(Value::Null),
        );
    }
    InitializeResult {
        protocol_version: negotiated.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(json!({"listChanged": false})),
            ..ServerCapabilities::default()
        },
        server_info: server_info.clone(),
        instructions: None,
    }
}

impl Feature for InitializeFeature {
    fn name(&self) -> &str {
        "initialize"
    }

    fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()> {
        let server_info = self.server_info.clone();
        ctx.register_handler(
            methods::INITIALIZE,
            Arc::new(FnHandler::new(move |_facade, message, ctx, _info| {
                let server_info = server_info.clone();
                async move {
                    let request: InitializeRequest = message.params_as()?;
                    info!(
                        client = %request.client_info.name,
                        requested = %request.protocol_version,
                        "initialize"
                    );
                    let result =
                        perform_initialize(&request, &server_info, ctx.session.as_ref());
                    serde_json::to_value(result).map_err(McpError::from)
                }
            })),
        )?;

        let on_ready = self.on_ready.clone();
        let ready_sessions = Arc::clone(&self.ready_sessions);
        ctx.register_handler(
            methods::NOTIFICATIONS_INITIALIZED,
            Arc::new(FnHandler::new(move |_facade, _message, ctx, _info| {
                let on_ready = on_ready.clone();
                let ready_sessions = Arc::clone(&ready_sessions);
                async move {
                    if let Some(session) = &ctx.session {
                        session.transition(SessionState::Initialized);
                        if ready_sessions.insert(session.id().to_string()) {
                            info!(session = session.id(), "session ready");
                            if let Some(on_ready) = &on_ready {
                                on_ready(session.id());
                            }
                        }
                    }
                    Ok(Value::Null)
                }
            })),
        )
    }
}

/// A single `echo` tool behind `tools/list` and `tools/call`.
pub struct EchoToolFeature;

fn echo_tool_descriptor() -> Value {
    json!({
        "name": "echo",
        "description": "Echo the provided text back to the caller",
        "inputSchema": {
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to echo"}
            },
            "required": ["text"]
        }
    })
}

fn call_echo_tool(name: &str, arguments: &Value) -> McpResult<Value> {
    if name != "echo" {
        return Err(McpError::invalid_params(format!("Tool not found: {name}")));
    }
    let text = arguments
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| McpError::invalid_params("Missing 'text' argument"))?;
    Ok(json!({
        "content": [{"type": "text", "text": text}]
    }))
}

impl Feature for EchoToolFeature {
    fn name(&self) -> &str {
        "echo-tool"
    }

    fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()> {
        ctx.register_handler(
            methods::TOOLS_LIST,
            Arc::new(FnHandler::new(|_facade, _message, _ctx, _info| async {
                Ok(json!({"tools": [echo_tool_descriptor()]}))
            })),
        )?;

        ctx.register_handler(
            methods::TOOLS_CALL,
            Arc::new(FnHandler::new(|_facade, message, ctx, _info| async move {
                let params = message.params.unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| McpError::invalid_params("Missing 'name' parameter"))?;
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                ctx.logger.debug(&format!("calling tool {name}"), None);
                call_echo_tool(name, &arguments)
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmcp_protocol::ClientCapabilities;

    fn initialize_request(version: &str) -> InitializeRequest {
        InitializeRequest {
            protocol_version: version.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "c".into(),
                version: "1".into(),
            },
        }
    }

    #[test]
    fn test_initialize_records_session_metadata() {
        let session = Session::new("s1");
        let server_info = Implementation {
            name: "mcp-example-server".into(),
            version: "0.1.0".into(),
        };

        let result =
            perform_initialize(&initialize_request("2025-11-25"), &server_info, Some(&session));

        assert_eq!(result.protocol_version, "2025-11-25");
        assert_eq!(result.server_info.name, "mcp-example-server");
        assert_eq!(session.protocol_version().as_deref(), Some("2025-11-25"));
        assert_eq!(session.client_info().unwrap().name, "c");
        assert_eq!(session.server_info().unwrap().name, "mcp-example-server");
    }

    #[test]
    fn test_initialize_falls_back_on_unknown_version() {
        let server_info = Implementation {
            name: "s".into(),
            version: "0".into(),
        };
        let result = perform_initialize(&initialize_request("2020-01-01"), &server_info, None);
        assert_eq!(
            result.protocol_version,
            meshmcp_protocol::latest_protocol_version()
        );
    }

    #[test]
    fn test_echo_tool_roundtrip() {
        let result = call_echo_tool("echo", &json!({"text": "hi"})).unwrap();
        assert_eq!(result["content"][0]["text"], "hi");
        assert_eq!(result["content"][0]["type"], "text");
    }

    #[test]
    fn test_echo_tool_rejects_unknown_tool_and_missing_text() {
        assert!(call_echo_tool("nope", &json!({"text": "hi"})).is_err());
        assert!(call_echo_tool("echo", &json!({})).is_err());
    }
}

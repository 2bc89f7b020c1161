//! Response-mode selection.
//!
//! A POST carrying requests is answered either with a buffered JSON body or
//! with an event stream. The choice is a pure function of the parsed
//! messages (and optionally the session), kept overridable for
//! deployment-specific behavior.

use std::sync::Arc;

use meshmcp_protocol::{ParsedMessage, methods, progress_token_of};
use meshmcp_server::Session;

/// How a POST carrying requests is answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseMode {
    /// Buffered `application/json` body
    Json,
    /// `text/event-stream` body
    Sse,
}

/// Pluggable mode selector.
pub type ResponseModePolicy =
    Arc<dyn Fn(&[ParsedMessage], Option<&Session>) -> ResponseMode + Send + Sync>;

/// Methods that tend to produce streamed output (progress, partial
/// results) and therefore default to SSE.
const STREAMING_PRONE_METHODS: &[&str] = &[
    methods::TOOLS_CALL,
    methods::PROMPTS_GET,
    methods::SAMPLING_CREATE_MESSAGE,
];

/// The built-in policy: SSE when any request's method is streaming-prone
/// or any request carries `_meta.progressToken`; JSON otherwise.
pub fn default_response_mode(
    messages: &[ParsedMessage],
    _session: Option<&Session>,
) -> ResponseMode {
    for message in messages {
        let ParsedMessage::Request(request) = message else {
            continue;
        };
        if STREAMING_PRONE_METHODS.contains(&request.method.as_str()) {
            return ResponseMode::Sse;
        }
        if progress_token_of(request).is_some() {
            return ResponseMode::Sse;
        }
    }
    ResponseMode::Json
}

/// The default policy as a [`ResponseModePolicy`] value.
pub fn default_policy() -> ResponseModePolicy {
    Arc::new(default_response_mode)
}

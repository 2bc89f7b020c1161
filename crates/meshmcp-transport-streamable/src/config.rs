//! Configuration for the Streamable HTTP transport.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::policy::{ResponseModePolicy, default_policy};

/// HTTP listener configuration.
#[derive(Clone)]
pub struct HttpServerConfig {
    /// Listen port.
    pub port: u16,

    /// Listen host. Default: `0.0.0.0`.
    pub host: String,

    /// Path of the MCP endpoint. Default: `/mcp`.
    pub endpoint: String,

    /// Allowed CORS origins. Empty means any origin (development default).
    pub allowed_origins: Vec<String>,

    /// Hook applied to the router after the MCP routes are installed.
    ///
    /// This is where embedders stack ordered tower layers and middleware;
    /// a layer that writes a response short-circuits the chain with
    /// standard tower semantics.
    pub router_hook: Option<Arc<dyn Fn(Router) -> Router + Send + Sync>>,
}

impl HttpServerConfig {
    /// Configuration listening on the given port with defaults elsewhere.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            host: "0.0.0.0".to_string(),
            endpoint: "/mcp".to_string(),
            allowed_origins: Vec::new(),
            router_hook: None,
        }
    }

    /// Set the listen host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the MCP endpoint path.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Restrict CORS to these origins.
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Install a router hook (middleware chain).
    pub fn with_router_hook(
        mut self,
        hook: impl Fn(Router) -> Router + Send + Sync + 'static,
    ) -> Self {
        self.router_hook = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for HttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerConfig")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("endpoint", &self.endpoint)
            .field("allowed_origins", &self.allowed_origins)
            .field("has_router_hook", &self.router_hook.is_some())
            .finish()
    }
}

/// Behavior of the Streamable HTTP endpoint.
#[derive(Clone)]
pub struct StreamableConfig {
    /// Ceiling on the total wait for responses in JSON mode, across the
    /// whole batch. Default: 30 seconds.
    pub response_timeout: Duration,

    /// Selects `json` vs `sse` per POST. Default: the built-in policy.
    pub response_mode_policy: ResponseModePolicy,

    /// Whether GET opens the background channel. Default: true.
    pub enable_background_channel: bool,

    /// Whether DELETE terminates sessions. Default: true.
    pub enable_session_termination: bool,

    /// SSE keep-alive comment interval. Default: 15 seconds.
    pub keepalive_interval: Duration,

    /// Maximum POST body size in bytes. Default: 1 MiB.
    pub max_body_size: usize,
}

impl Default for StreamableConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            response_mode_policy: default_policy(),
            enable_background_channel: true,
            enable_session_termination: true,
            keepalive_interval: Duration::from_secs(15),
            max_body_size: 1024 * 1024,
        }
    }
}

impl StreamableConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the JSON-mode response wait ceiling.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Replace the response-mode policy.
    pub fn with_response_mode_policy(mut self, policy: ResponseModePolicy) -> Self {
        self.response_mode_policy = policy;
        self
    }

    /// Enable or disable the GET background channel.
    pub fn with_background_channel(mut self, enable: bool) -> Self {
        self.enable_background_channel = enable;
        self
    }

    /// Enable or disable DELETE session termination.
    pub fn with_session_termination(mut self, enable: bool) -> Self {
        self.enable_session_termination = enable;
        self
    }

    /// Set the SSE keep-alive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the POST body size cap.
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }
}

impl std::fmt::Debug for StreamableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableConfig")
            .field("response_timeout", &self.response_timeout)
            .field("enable_background_channel", &self.enable_background_channel)
            .field("enable_session_termination", &self.enable_session_termination)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("max_body_size", &self.max_body_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamableConfig::default();
        assert_eq!(config.response_timeout, Duration::from_secs(30));
        assert!(config.enable_background_channel);
        assert!(config.enable_session_termination);
        assert_eq!(config.max_body_size, 1024 * 1024);

        let http = HttpServerConfig::new(8080);
        assert_eq!(http.host, "0.0.0.0");
        assert_eq!(http.endpoint, "/mcp");
    }

    #[test]
    fn test_builder_pattern() {
        let config = StreamableConfig::new()
            .with_response_timeout(Duration::from_secs(5))
            .with_background_channel(false)
            .with_max_body_size(64 * 1024);

        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert!(!config.enable_background_channel);
        assert_eq!(config.max_body_size, 64 * 1024);
    }
}

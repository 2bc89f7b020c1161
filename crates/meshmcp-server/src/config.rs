//! Engine configuration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use meshmcp_protocol::McpResult;

use crate::context::{IdGenerator, UuidGenerator};
use crate::hooks::{EngineHooks, NoopHooks};

/// Message validation seam.
///
/// Optional: when both a validator and a message schema are configured the
/// engine validates every incoming request before dispatch.
pub trait SchemaValidator: Send + Sync {
    /// Validate a message against a schema; error on invalid input.
    fn validate(&self, message: &Value, schema: &Value) -> McpResult<()>;
}

/// Configuration for [`ProtocolEngine`](crate::engine::ProtocolEngine).
#[derive(Clone)]
pub struct EngineConfig {
    /// Default timeout for outgoing requests when the caller sets none.
    /// Default: 60 seconds.
    pub default_request_timeout: Duration,

    /// Whether missing client capabilities make server-initiated requests
    /// fail instead of logging. Default: false.
    pub enforce_strict_capabilities: bool,

    /// Lifecycle hooks. Default: no-ops.
    pub hooks: Arc<dyn EngineHooks>,

    /// Id generator for connection ids and engine-minted request ids.
    pub id_generator: Arc<dyn IdGenerator>,

    /// Optional message validator.
    pub schema_validator: Option<Arc<dyn SchemaValidator>>,

    /// Schema handed to the validator for incoming requests.
    pub message_schema: Option<Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_request_timeout: Duration::from_secs(60),
            enforce_strict_capabilities: false,
            hooks: Arc::new(NoopHooks),
            id_generator: Arc::new(UuidGenerator),
            schema_validator: None,
            message_schema: None,
        }
    }
}

impl EngineConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default request timeout.
    pub fn with_default_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    /// Make capability checks fatal.
    pub fn with_strict_capabilities(mut self, strict: bool) -> Self {
        self.enforce_strict_capabilities = strict;
        self
    }

    /// Install lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn EngineHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the id generator.
    pub fn with_id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    /// Validate incoming requests against a schema.
    pub fn with_validation(
        mut self,
        validator: Arc<dyn SchemaValidator>,
        message_schema: Value,
    ) -> Self {
        self.schema_validator = Some(validator);
        self.message_schema = Some(message_schema);
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("default_request_timeout", &self.default_request_timeout)
            .field("enforce_strict_capabilities", &self.enforce_strict_capabilities)
            .field("has_schema_validator", &self.schema_validator.is_some())
            .finish_non_exhaustive()
    }
}

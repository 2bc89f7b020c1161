//! Feature installation.
//!
//! A feature is a pluggable unit of functionality that registers one or
//! more method handlers with the engine when installed. Features are
//! opaque to the engine beyond their `initialize` call.

use std::sync::Arc;

use dashmap::DashMap;

use meshmcp_protocol::{McpError, McpResult};

use crate::handler::MethodHandler;

/// Installation context exposed to a feature.
///
/// The only capability a feature gets is handler registration; request and
/// notification handlers share one method table, disambiguated by the
/// `notifications/` method prefix.
pub struct FeatureContext<'a> {
    pub(crate) handlers: &'a DashMap<String, Arc<dyn MethodHandler>>,
}

impl FeatureContext<'_> {
    /// Register a handler for a method.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the method already has a handler.
    pub fn register_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> McpResult<()> {
        use dashmap::mapref::entry::Entry;

        let method = method.into();
        match self.handlers.entry(method.clone()) {
            Entry::Occupied(_) => Err(McpError::configuration(format!(
                "handler already registered for method '{method}'"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }
}

/// A pluggable unit of functionality.
pub trait Feature: Send + Sync {
    /// Feature name, for logs.
    fn name(&self) -> &str;

    /// Register this feature's handlers.
    fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()>;
}

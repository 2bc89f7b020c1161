//! Handler-facing context: logging and id generation.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

/// Logger handed to handlers through their context.
///
/// Forwards to `tracing` with the owning request's coordinates attached as
/// fields, so handler output lands in the same structured stream as the
/// engine's own logs.
#[derive(Clone)]
pub struct ContextLogger {
    instance_id: Arc<str>,
    session_id: Option<Arc<str>>,
}

impl ContextLogger {
    pub(crate) fn new(instance_id: &str, session_id: Option<&str>) -> Self {
        Self {
            instance_id: Arc::from(instance_id),
            session_id: session_id.map(Arc::from),
        }
    }

    /// Debug-level message.
    pub fn debug(&self, message: &str, context: Option<&Value>) {
        tracing::debug!(
            instance = %self.instance_id,
            session = self.session_id.as_deref().unwrap_or("-"),
            context = context.map(|c| c.to_string()).unwrap_or_default(),
            "{message}"
        );
    }

    /// Info-level message.
    pub fn info(&self, message: &str, context: Option<&Value>) {
        tracing::info!(
            instance = %self.instance_id,
            session = self.session_id.as_deref().unwrap_or("-"),
            context = context.map(|c| c.to_string()).unwrap_or_default(),
            "{message}"
        );
    }

    /// Warning-level message.
    pub fn warn(&self, message: &str, context: Option<&Value>) {
        tracing::warn!(
            instance = %self.instance_id,
            session = self.session_id.as_deref().unwrap_or("-"),
            context = context.map(|c| c.to_string()).unwrap_or_default(),
            "{message}"
        );
    }

    /// Error-level message with the originating error.
    pub fn error(&self, message: &str, error: &dyn fmt::Display, context: Option<&Value>) {
        tracing::error!(
            instance = %self.instance_id,
            session = self.session_id.as_deref().unwrap_or("-"),
            error = %error,
            context = context.map(|c| c.to_string()).unwrap_or_default(),
            "{message}"
        );
    }
}

impl fmt::Debug for ContextLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLogger")
            .field("instance_id", &self.instance_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Options for [`IdGenerator::generate`].
#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    /// Prefix prepended with a `-`
    pub prefix: Option<String>,
    /// Suffix appended with a `-`
    pub suffix: Option<String>,
    /// Truncate the random core to this many characters
    pub length: Option<usize>,
}

impl GenerateOptions {
    /// Options with only a prefix.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }
}

/// Id generation seam. Uniqueness within the engine's lifetime is the
/// generator's contract.
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh id.
    fn generate(&self, options: GenerateOptions) -> String;
}

/// Default generator backed by UUID v4.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self, options: GenerateOptions) -> String {
        let mut core = Uuid::new_v4().simple().to_string();
        if let Some(len) = options.length {
            core.truncate(len.max(1));
        }
        match (options.prefix, options.suffix) {
            (Some(p), Some(s)) => format!("{p}-{core}-{s}"),
            (Some(p), None) => format!("{p}-{core}"),
            (None, Some(s)) => format!("{core}-{s}"),
            (None, None) => core,
        }
    }
}

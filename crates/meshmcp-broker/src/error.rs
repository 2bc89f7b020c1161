//! Broker error types.

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by broker backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The broker connection is gone or was never established
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Publish failed after the connection was established
    #[error("Publish failed on '{subject}': {message}")]
    Publish {
        /// Subject the publish targeted
        subject: String,
        /// Backend error message
        message: String,
    },

    /// The backend cannot serve this subscription
    #[error("Subscribe failed on '{pattern}': {message}")]
    Subscribe {
        /// Pattern the subscribe targeted
        pattern: String,
        /// Backend error message
        message: String,
    },

    /// The backend does not implement a requested pattern feature
    #[error("Unsupported pattern '{0}'")]
    UnsupportedPattern(String),

    /// The broker has been closed
    #[error("Broker closed")]
    Closed,
}

impl BrokerError {
    /// Publish failure on a subject.
    pub fn publish(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Subscribe failure on a pattern.
    pub fn subscribe(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe {
            pattern: pattern.into(),
            message: message.into(),
        }
    }
}

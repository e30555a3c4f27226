//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by adapters, the resolver and the worker.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backend could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No message became available within the pop timeout.
    #[error("Queue is empty: {0}")]
    QueueEmpty(String),

    /// The message body is not a valid job envelope.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The handler named by the envelope cannot be resolved.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// The handler raised while executing.
    #[error("Job execution failed: {0}")]
    Execution(String),

    /// The adapter lacks a capability required by the configuration.
    #[error("Adapter '{adapter}' does not support {capability}")]
    Capability {
        adapter: &'static str,
        capability: &'static str,
    },

    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// JSON (de)serialization failure outside of envelope decoding.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Returns true for failures that no redelivery can fix; the message
    /// must be deleted.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            QueueError::Decode(_) | QueueError::HandlerNotFound(_) | QueueError::Capability { .. }
        )
    }

    /// Returns true if this error only signals that nothing was available.
    pub fn is_empty(&self) -> bool {
        matches!(self, QueueError::QueueEmpty(_))
    }

    /// Returns true if the backend was unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_permanent_decode() {
        let err = QueueError::Decode("expected value at line 1".into());
        assert!(err.is_permanent());
    }

    #[test]
    fn test_is_permanent_handler_not_found() {
        let err = QueueError::HandlerNotFound("Mailer".into());
        assert!(err.is_permanent());
    }

    #[test]
    fn test_is_not_permanent_execution() {
        let err = QueueError::Execution("smtp timeout".into());
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_is_not_permanent_connection() {
        let err = QueueError::Connection("refused".into());
        assert!(!err.is_permanent());
        assert!(err.is_connection());
    }

    #[test]
    fn test_is_empty() {
        assert!(QueueError::QueueEmpty("default".into()).is_empty());
        assert!(!QueueError::Backend("oops".into()).is_empty());
    }

    #[test]
    fn test_error_display_capability() {
        let err = QueueError::Capability {
            adapter: "iron",
            capability: "bury",
        };
        let msg = err.to_string();
        assert!(msg.contains("iron") && msg.contains("bury"));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = QueueError::from(json_err);
        assert!(matches!(err, QueueError::Serialization(_)));
        assert!(!err.is_permanent());
    }
}

// src/utils/errors.rs
//! Engine error types

use thiserror::Error;

/// Top-level error type for the replay engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration is missing, malformed, or inconsistent
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Disk-side queue storage failed (spill write, restore read, cleanup)
    #[error("Storage error: {0}")]
    StorageFailed(String),

    /// A restored overflow segment did not match its recorded size
    #[error("Queue corruption: segment held {actual} events, expected {expected}")]
    QueueCorruption { expected: usize, actual: usize },

    /// A replayed command exceeded its execution timeout
    #[error("Command timed out after {0}ms")]
    CommandTimeout(u64),

    /// The target rejected a replayed command
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The connection to the target is unusable
    #[error("Connection fault: {0}")]
    ConnectionFault(String),

    /// The event source failed to produce events
    #[error("Source error: {0}")]
    SourceFailed(String),

    /// The engine is shutting down and no longer accepts work
    #[error("Engine is shutting down")]
    Shutdown,
}

impl EngineError {
    /// Whether this error counts against the timeout retry budget
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::CommandTimeout(_))
    }

    /// Whether this error indicates a broken connection rather than a bad command
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, EngineError::ConnectionFault(_))
    }

    /// Short class label used in logs and error markers
    pub fn class(&self) -> &'static str {
        match self {
            EngineError::ConfigError(_) => "config",
            EngineError::StorageFailed(_) => "storage",
            EngineError::QueueCorruption { .. } => "corruption",
            EngineError::CommandTimeout(_) => "timeout",
            EngineError::CommandFailed(_) => "command",
            EngineError::ConnectionFault(_) => "connection",
            EngineError::SourceFailed(_) => "source",
            EngineError::Shutdown => "shutdown",
        }
    }
}

/// Convenience result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::QueueCorruption {
            expected: 500,
            actual: 499,
        };
        let msg = err.to_string();
        assert!(msg.contains("499"));
        assert!(msg.contains("500"));
    }

    #[test]
    fn test_error_classes() {
        assert!(EngineError::CommandTimeout(30000).is_timeout());
        assert!(!EngineError::CommandTimeout(30000).is_connection_fault());
        assert!(EngineError::ConnectionFault("reset by peer".to_string()).is_connection_fault());
        assert_eq!(EngineError::Shutdown.class(), "shutdown");
    }
}

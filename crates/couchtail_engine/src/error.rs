//! Error types for the tailer.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for tailer operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can end a session or the whole tailer.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network-level failure while connecting (refused, reset, unreachable,
    /// TLS handshake).
    #[error("connection failed: {message}")]
    ConnectFailed {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server reports that the database does not exist.
    #[error("database not found: {database}")]
    NotFound {
        /// Database name.
        database: String,
    },

    /// The server answered with an unexpected HTTP status.
    #[error("unexpected HTTP status {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response reason or body excerpt.
        message: String,
    },

    /// The response body failed while it was being read.
    #[error("stream error: {0}")]
    Stream(String),

    /// No data arrived within the idle timeout.
    #[error("no data received within the idle timeout")]
    Timeout,

    /// The downstream sink rejected an event.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The checkpoint location cannot be used (fatal at startup).
    #[error("checkpoint store unavailable at {path:?}: {reason}")]
    CheckpointStoreUnavailable {
        /// Location of the checkpoint.
        path: Option<PathBuf>,
        /// Why it cannot be used.
        reason: String,
    },

    /// Persisting a checkpoint failed after startup.
    #[error("checkpoint write failed: {0}")]
    CheckpointStore(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The host requested a stop.
    #[error("tailer cancelled")]
    Cancelled,
}

impl EngineError {
    /// Creates a retryable connection error.
    pub fn connect_retryable(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable connection error.
    pub fn connect_fatal(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a checkpoint-unavailable error.
    pub fn store_unavailable(path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointStoreUnavailable {
            path,
            reason: reason.into(),
        }
    }

    /// Returns true if a new session may be attempted after this error.
    ///
    /// Transient: connection and stream failures, timeouts, missing
    /// database, unexpected statuses, delivery failures. Fatal: cancellation,
    /// configuration and checkpoint storage failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ConnectFailed { retryable, .. } => *retryable,
            EngineError::NotFound { .. }
            | EngineError::Http { .. }
            | EngineError::Stream(_)
            | EngineError::Timeout
            | EngineError::Delivery(_) => true,
            EngineError::CheckpointStoreUnavailable { .. }
            | EngineError::CheckpointStore(_)
            | EngineError::Config(_)
            | EngineError::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            EngineError::Config(err.to_string())
        } else if err.is_timeout() {
            EngineError::Timeout
        } else if err.is_connect() || err.is_request() {
            EngineError::connect_retryable(err.to_string())
        } else if let Some(status) = err.status() {
            EngineError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            EngineError::Stream(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(EngineError::connect_retryable("connection reset").is_retryable());
        assert!(!EngineError::connect_fatal("invalid certificate").is_retryable());
        assert!(EngineError::Timeout.is_retryable());
        assert!(EngineError::NotFound {
            database: "db".into()
        }
        .is_retryable());
        assert!(EngineError::Delivery("queue closed".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::Config("port".into()).is_retryable());
        assert!(!EngineError::store_unavailable(None, "HOME unset").is_retryable());
        assert!(!EngineError::CheckpointStore("disk full".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = EngineError::NotFound {
            database: "users".into(),
        };
        assert_eq!(err.to_string(), "database not found: users");

        let err = EngineError::Http {
            status: 401,
            message: "unauthorized".into(),
        };
        assert!(err.to_string().contains("401"));
    }
}

//! Error types and handling for Massive Tree
//!
//! Every adapter and the orchestrator report failures through the single
//! [`Error`] enum below. Adapter errors bubble up unmodified; the orchestrator
//! only wraps them when it aggregates several backends.

use std::time::Duration;
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Massive Tree
#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted before a successful connect with lazy connect disabled
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Deadline exceeded at the orchestrator boundary. The outcome of the
    /// underlying operation is unknown.
    #[error("Operation `{operation}` timed out after {}ms (outcome unknown)", .budget.as_millis())]
    Timeout {
        /// Operation name (get, set, connect, ...)
        operation: String,
        /// Budget that was exceeded
        budget: Duration,
    },

    /// The concrete storage client rejected an operation
    #[error("Backend `{adapter}` failed: {message}")]
    Backend {
        /// Adapter or client that failed
        adapter: String,
        /// Human-readable failure description
        message: String,
    },

    /// Every adapter failed a fanned-out read
    #[error("All {attempted} backends failed `{operation}`; last error: {last}")]
    AllBackendsFailed {
        /// Operation name
        operation: String,
        /// Number of adapters tried
        attempted: usize,
        /// Error reported by the last adapter
        last: Box<Error>,
    },

    /// A single leaf failed during migration
    #[error("Migration of leaf `{path}` failed: {source}")]
    MigrationLeaf {
        /// Display form of the leaf path
        path: String,
        /// Underlying failure
        source: Box<Error>,
    },

    /// Numeric or list operation applied to a value of the wrong type
    #[error("Type mismatch at `{path}`: expected {expected}, found {found}")]
    TypeMismatch {
        /// Display form of the path
        path: String,
        /// Expected type name
        expected: &'static str,
        /// Actual type name found
        found: &'static str,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Advisory lock could not be acquired
    #[error("Lock error: {0}")]
    Lock(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Serialization/deserialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack serialization error
    #[error("MessagePack error: {0}")]
    MessagePack(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error
    #[error("MessagePack decode error: {0}")]
    MessagePackDecode(#[from] rmp_serde::decode::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(SerializationError::Json(err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl Error {
    /// Create a backend failure attributed to `adapter`
    pub fn backend(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a type mismatch error
    pub fn type_mismatch(path: impl Into<String>, expected: &'static str, found: &'static str) -> Self {
        Self::TypeMismatch {
            path: path.into(),
            expected,
            found,
        }
    }

    /// The innermost error, looking through orchestrator aggregation
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::AllBackendsFailed { last, .. } => last.root_cause(),
            Error::MigrationLeaf { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if this error (or its root cause) is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Error::Timeout { .. })
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::Timeout { .. } | Error::Backend { .. } | Error::Lock(_) | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_seen_through_aggregation() {
        let err = Error::AllBackendsFailed {
            operation: "get".into(),
            attempted: 2,
            last: Box::new(Error::Timeout {
                operation: "get".into(),
                budget: Duration::from_millis(50),
            }),
        };
        assert!(err.is_timeout());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out after 50ms"));
    }

    #[test]
    fn test_invalid_input_is_not_retryable() {
        let err = Error::invalid_input("bad");
        assert!(!err.is_timeout());
        assert!(!err.is_retryable());
    }
}

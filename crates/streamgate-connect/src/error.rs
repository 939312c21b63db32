//! Error types for streamgate-connect
//!
//! Provides structured error handling for both the runtime and connectors.
//!
//! Connector errors follow a fixed taxonomy that drives the run loop:
//!
//! | Variant | Raised by | Run loop reaction |
//! |---------|-----------|-------------------|
//! | `Auth` | `connect()` / fetch | fatal, never retried |
//! | `Unavailable` | `connect()` | fatal to that attempt, retried only by a supervisor |
//! | `Transient` | `produce_next()` | retried with bounded backoff |
//! | `RetriesExhausted` | run loop | fatal (promoted transient) |
//! | `Sink` | downstream sink | fatal |
//! | everything else | anywhere | fatal |

use std::fmt;
use thiserror::Error;

/// Result type alias for the streamgate-connect runtime
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Main error type for the streamgate-connect runtime
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source connector error
    #[error("Source '{name}' error: {message}")]
    Source { name: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connector error (from individual connectors)
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl ConnectError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a source error
    pub fn source(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Check if the underlying connector error was an authentication failure
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Connector(ConnectorError::Auth(_)))
    }
}

/// Errors that can occur in connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Credentials were rejected (invalid or expired token)
    #[error("authentication error: {0}")]
    Auth(String),

    /// External environment could not be reached
    #[error("environment unavailable: {0}")]
    Unavailable(String),

    /// Workspace or topic not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient error that may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Fatal error that will not succeed on retry
    #[error("fatal error: {0}")]
    Fatal(String),

    /// An in-flight call was woken by cancellation and ended without a record
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A transient error outlived the retry budget
    #[error("transient error persisted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ConnectorError>,
    },

    /// Downstream sink rejected a record
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Data serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConnectorError {
    /// Check if this error should be retried locally by the run loop
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Check if this error is the clean end of a call interrupted by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Check if this error can only come from establishing a session
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Unavailable(_) | Self::NotFound(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Promote a transient error that exceeded the retry cap
    pub fn retries_exhausted(attempts: u32, last: ConnectorError) -> Self {
        Self::RetriesExhausted {
            attempts,
            source: Box::new(last),
        }
    }
}

/// Error returned by a downstream sink when it cannot accept a record
#[derive(Debug, Error)]
#[error("sink '{sink}' rejected record: {message}")]
pub struct SinkError {
    pub sink: String,
    pub message: String,
}

impl SinkError {
    pub fn new(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            message: message.into(),
        }
    }
}

/// Connector status for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    /// Starting up (connecting)
    Starting,
    /// Streaming records
    Running,
    /// Stopped (completed or cancelled)
    Stopped,
    /// Failed permanently
    Failed,
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

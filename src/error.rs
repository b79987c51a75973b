//! Error handling for lsl-coord
//!
//! This module defines the error taxonomy shared by every layer of the crate
//! and a Result alias for use throughout.
//!
//! # Propagation
//!
//! - Per-endpoint failures inside a polling worker are contained: they are
//!   logged, counted and the endpoint is skipped.
//! - Protocol decode/validation failures are contained at the message handler
//!   boundary.
//! - Join and election failures, worker startup timeouts and configuration
//!   errors propagate to the caller.

use thiserror::Error;

/// Main error type for lsl-coord operations
#[derive(Error, Debug)]
pub enum CoordError {
    /// Endpoint creation, push or pull failure in the underlying transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bounded wait was exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or out-of-phase coordination message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The coordinator explicitly refused our join request
    #[error("Join rejected: {reason}")]
    JoinRejected { reason: String },

    /// A polling worker did not signal readiness in time
    #[error("Worker '{worker}' failed to start: {message}")]
    WorkerStartup { worker: String, message: String },

    /// Operation not permitted by a layer's configuration
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Leader election could not produce a winner
    #[error("Election error: {0}")]
    Election(String),

    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication between threads
    #[error("Channel error: {0}")]
    Channel(String),

    /// Operation requires a session phase or role we are not in
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CoordError>,
    },
}

impl CoordError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CoordError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        CoordError::Transport(message.into())
    }

    /// Shorthand for a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        CoordError::Protocol(message.into())
    }

    /// Shorthand for a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        CoordError::Timeout(message.into())
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &CoordError {
        match self {
            CoordError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the failed operation can reasonably succeed
    ///
    /// Transport failures are usually cured by recreating the endpoint and
    /// timeouts are often benign. Everything else reflects a decision or a
    /// defect that a retry will not change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            CoordError::Transport(_) | CoordError::Timeout(_) | CoordError::Channel(_)
        )
    }

    /// Whether this error is a coordinator's join refusal
    pub fn is_join_rejected(&self) -> bool {
        matches!(self.root(), CoordError::JoinRejected { .. })
    }
}

/// Result type alias for lsl-coord operations
pub type Result<T> = std::result::Result<T, CoordError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, toml::de::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| CoordError::Config(e.to_string()).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| CoordError::Config(e.to_string()).with_context(f()))
    }
}

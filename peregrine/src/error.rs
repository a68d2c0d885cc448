//! Error types for the peregrine runtime.
//!
//! Errors are split by concern: [`Error`] is the engine-level taxonomy,
//! [`ToolError`] covers tool dispatch, and [`StoreError`] covers the
//! persistence adapter. Tool-level failures are generally *not* propagated
//! as `Err` — they are folded into a [`ToolResult`](crate::tool::ToolResult)
//! so the reasoning model can observe and react to them.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An illegal task or step state transition was attempted.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidState {
        /// The state the entity was in.
        from: String,
        /// The state that was requested.
        to: String,
    },

    /// Error from an LLM provider.
    #[error("provider '{provider}' error: {message}")]
    Provider {
        /// Name of the provider that failed.
        provider: String,
        /// The underlying error message.
        message: String,
    },

    /// Error from the persistence adapter.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Error during tool dispatch.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The task was cancelled by an external caller.
    #[error("task cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-state error.
    #[must_use]
    pub fn invalid_state(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidState {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a provider error.
    #[must_use]
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Errors produced while dispatching a tool call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool with the given name is registered.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// The arguments did not match the tool's parameter schema.
    #[error("validation: {0}")]
    InvalidArguments(String),

    /// The tool handler returned an error.
    #[error("{0}")]
    Execution(String),

    /// The tool exceeded its per-call timeout.
    #[error("timeout after {0}s")]
    Timeout(u64),
}

impl ToolError {
    /// Create an execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// Errors from the persistence adapter.
///
/// Transient storage faults are retried inside the adapter; anything that
/// reaches the caller is permanent and fails the owning task.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An approval was resolved a second time.
    #[error("approval '{0}' already resolved")]
    AlreadyResolved(String),

    /// The backing storage failed permanently.
    #[error("storage error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::invalid_state("complete", "executing");
        assert_eq!(
            err.to_string(),
            "invalid state transition: complete -> executing"
        );

        let err = Error::provider("ollama", "connection refused");
        assert!(err.to_string().contains("ollama"));
    }

    #[test]
    fn tool_error_validation_prefix() {
        let err = ToolError::InvalidArguments("missing field `url`".to_owned());
        assert!(err.to_string().starts_with("validation:"));
    }

    #[test]
    fn store_error_converts() {
        let err: Error = StoreError::AlreadyResolved("ap-1".to_owned()).into();
        assert!(matches!(err, Error::Store(StoreError::AlreadyResolved(_))));
    }
}

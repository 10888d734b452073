//! Error types for synapse-rpc.

use thiserror::Error;

/// Main error type for all RPC server operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker collaborator rejected an operation.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Queue declaration, binding or consumer registration failed.
    #[error("Topology error: {0}")]
    Topology(String),

    /// Invalid server configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error raised by a user handler.
    #[error("{0}")]
    Handler(String),

    /// Channel or connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - too many replies waiting to be published.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl RpcError {
    /// Convenience constructor for handler-raised errors.
    pub fn handler(message: impl Into<String>) -> Self {
        RpcError::Handler(message.into())
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_display_is_bare_message() {
        let err = RpcError::handler("division by zero");
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: RpcError = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("JSON error"));
    }
}

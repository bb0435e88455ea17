//! Error types for the conduit-mcp framework.

use thiserror::Error;

use crate::protocol::{error_codes, JsonRpcError};

/// Result type alias for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the framework.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Wire Errors =====
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ===== Dispatch Errors =====
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    // ===== Input Errors =====
    #[error("Invalid params: {message}")]
    InvalidParams {
        message: String,
        data: Option<serde_json::Value>,
    },

    // ===== Lookup Errors =====
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    // ===== Lifecycle Errors =====
    #[error("Session not initialized")]
    NotInitialized,

    #[error("Session closed")]
    SessionClosed,

    // ===== Service Errors =====
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timeout: operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Cancelled: operation was cancelled")]
    Cancelled,

    // ===== Transport Errors =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an `InvalidParams` error with just a message.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidParams` error carrying structured detail about which
    /// property or constraint was violated.
    pub fn invalid_params_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: Some(data),
        }
    }

    /// The JSON-RPC error code this error maps to on the wire.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Parse(_) | Self::Json(_) => error_codes::PARSE_ERROR,
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => error_codes::INVALID_PARAMS,
            Self::ResourceNotFound(_) | Self::NotInitialized => error_codes::RESOURCE_NOT_FOUND,
            Self::ServiceUnavailable(_) | Self::Timeout { .. } => error_codes::SERVICE_UNAVAILABLE,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Render this error as a JSON-RPC error object.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let data = match self {
            Self::InvalidParams { data, .. } => data.clone(),
            _ => None,
        };
        JsonRpcError {
            code: self.jsonrpc_code(),
            message: self.to_string(),
            data,
        }
    }

    /// Check whether this error represents a transient delivery failure that
    /// the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. } | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let err = Error::MethodNotFound("tools/unknown".to_string());
        assert_eq!(err.to_string(), "Method not found: tools/unknown");

        let err = Error::Timeout { seconds: 60 };
        assert_eq!(
            err.to_string(),
            "Timeout: operation timed out after 60 seconds"
        );
    }

    #[test]
    fn test_jsonrpc_code_mapping() {
        assert_eq!(Error::Parse("bad".into()).jsonrpc_code(), -32700);
        assert_eq!(Error::InvalidRequest("bad".into()).jsonrpc_code(), -32600);
        assert_eq!(Error::MethodNotFound("x".into()).jsonrpc_code(), -32601);
        assert_eq!(Error::invalid_params("missing").jsonrpc_code(), -32602);
        assert_eq!(Error::ResourceNotFound("u".into()).jsonrpc_code(), -32002);
        assert_eq!(Error::NotInitialized.jsonrpc_code(), -32002);
        assert_eq!(
            Error::ServiceUnavailable("breaker open".into()).jsonrpc_code(),
            -32000
        );
        assert_eq!(Error::Timeout { seconds: 1 }.jsonrpc_code(), -32000);
        assert_eq!(Error::Internal("boom".into()).jsonrpc_code(), -32603);
    }

    #[test]
    fn test_invalid_params_data_preserved() {
        let err = Error::invalid_params_data(
            "Missing required argument",
            json!({"argument": "path", "constraint": "required"}),
        );
        let wire = err.to_jsonrpc();
        assert_eq!(wire.code, -32602);
        assert_eq!(wire.data.unwrap()["argument"], "path");
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::Transport("pipe closed".into()).is_transient());
        assert!(Error::Timeout { seconds: 2 }.is_transient());
        assert!(!Error::invalid_params("bad cursor").is_transient());
        assert!(!Error::Cancelled.is_transient());
    }
}

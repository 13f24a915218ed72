//! Error types for chanmux.
//!
//! Protocol problems on the wire (bad envelopes, unknown channels) are logged
//! and dropped by the multiplexer and never surface here. The variants below
//! cover what callers actually have to handle: transport loss, RPC failures
//! and service registration errors.

use std::time::Duration;
use thiserror::Error;

/// Main error type for chanmux.
#[derive(Debug, Error)]
pub enum MuxError {
    // Wire errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Transport closed: {reason}")]
    TransportClosed { reason: String },

    #[error("Multiplexer handler already initialized")]
    AlreadyInitialized,

    // Channel errors
    #[error("Channel not found: {id}")]
    ChannelNotFound { id: String },

    #[error("Channel {id} closed before it opened")]
    ChannelClosed { id: String },

    // RPC errors
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("RPC call timed out after {0:?}")]
    Timeout(Duration),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Registry errors
    #[error("Service not found: {token}")]
    ServiceNotFound { token: String },

    #[error("Service {token} is not a {expected}")]
    ServiceTypeMismatch {
        token: String,
        expected: &'static str,
    },

    #[error("Circular dependency while resolving {token}")]
    CircularDependency { token: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for chanmux operations.
pub type Result<T> = std::result::Result<T, MuxError>;

impl From<std::io::Error> for MuxError {
    fn from(err: std::io::Error) -> Self {
        MuxError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MuxError {
    fn from(err: serde_json::Error) -> Self {
        MuxError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MuxError {
    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Service not found
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            MuxError::Protocol { .. } | MuxError::Json { .. } => -32700,

            MuxError::MethodNotFound { .. } => -32601,

            MuxError::InvalidParams { .. } => -32602,

            MuxError::Io { .. }
            | MuxError::TransportClosed { .. }
            | MuxError::ConnectionClosed
            | MuxError::Timeout(_) => -32000,

            MuxError::ServiceNotFound { .. } => -32001,

            // Remote errors keep the code they arrived with
            MuxError::Rpc { code, .. } => *code,

            _ => -32603,
        }
    }

    /// Check if the failed operation may succeed once the transport recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MuxError::Io { .. }
                | MuxError::TransportClosed { .. }
                | MuxError::ConnectionClosed
                | MuxError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MuxError::ChannelNotFound {
            id: "C1:Other".into(),
        };
        assert_eq!(err.to_string(), "Channel not found: C1:Other");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            MuxError::MethodNotFound {
                service: "echo".into(),
                method: "shout".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(MuxError::ConnectionClosed.to_rpc_error_code(), -32000);
        assert_eq!(
            MuxError::Rpc {
                code: -32042,
                message: "remote".into()
            }
            .to_rpc_error_code(),
            -32042
        );
        assert_eq!(MuxError::Other("boom".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(MuxError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(MuxError::ConnectionClosed.is_retryable());
        assert!(!MuxError::CircularDependency { token: "a".into() }.is_retryable());
    }
}

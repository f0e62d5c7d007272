//! Error types for the PostgreSQL proxy
//!
//! This module provides the error type shared by the codec, the router, the
//! origin pool and the session state machine.

use std::io;
use thiserror::Error;

/// Result type for the proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error type for the proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Routing configuration could not be decoded
    #[error("Invalid routing configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// PostgreSQL protocol error (malformed frame, unexpected message)
    #[error("PostgreSQL protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream, possibly in the middle of a frame
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// A declared frame length exceeded the allowed budget
    #[error("Frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Declared length
        length: usize,
        /// Configured limit
        limit: usize,
    },

    /// No routing rule matched the connection parameters
    #[error("Routing error: {0}")]
    Routing(String),

    /// A routing rule names a provider that is not registered
    #[error("Unknown credential provider '{0}'")]
    UnknownProvider(String),

    /// No origin connection could be handed out for a target
    #[error("Origin pool for '{0}' is exhausted")]
    PoolExhausted(String),

    /// Authentication against the origin failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal bookkeeping reached a state that should be impossible
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ProxyError {
    /// Whether this error means the peer went away rather than misbehaved
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::ConnectionClosed => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Convert a ProxyError to a PostgreSQL error code and message
pub fn to_pg_error(error: &ProxyError) -> (String, String) {
    match error {
        ProxyError::Auth(msg) => ("28000".to_string(), msg.clone()), // Invalid authorization specification
        ProxyError::Protocol(msg) => ("08P01".to_string(), msg.clone()), // Protocol violation
        ProxyError::FrameTooLarge { .. } => ("08P01".to_string(), error.to_string()),
        ProxyError::Routing(msg) => ("3D000".to_string(), msg.clone()), // Invalid catalog name
        ProxyError::UnknownProvider(_) => ("58000".to_string(), error.to_string()), // System error
        ProxyError::PoolExhausted(_) => ("53300".to_string(), error.to_string()), // Too many connections
        ProxyError::Connection(msg) => ("08006".to_string(), msg.clone()), // Connection failure
        ProxyError::Timeout(msg) => ("57014".to_string(), format!("Timeout: {}", msg)), // Query canceled
        _ => ("XX000".to_string(), format!("Internal error: {}", error)), // Internal error
    }
}

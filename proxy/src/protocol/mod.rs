//! PostgreSQL wire protocol implementation
//!
//! This module provides the frame decoder used on both sides of a proxied
//! connection, plus constructors and readers for the messages the proxy
//! emits or inspects.

/// Message types for the PostgreSQL wire protocol
pub mod message;

/// Frame decoder for client and origin streams
pub mod codec;

/// Message parser for PostgreSQL wire protocol messages
pub mod parser;

/// Message formatter for PostgreSQL wire protocol messages
pub mod formatter;

// Re-export common types
pub use self::codec::{FrameDecoder, DEFAULT_MAX_FRAME_LEN, MAX_STARTUP_LEN};
pub use self::message::{
    AuthenticationRequest, BackendKeyData, ConnectionParams, Frame, FrameKind, TransactionStatus,
};

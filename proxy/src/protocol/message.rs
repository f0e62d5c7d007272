//! Message types for the PostgreSQL wire protocol
//!
//! Every PostgreSQL message travels as a *frame*. Most frames start with a
//! one-byte tag followed by a big-endian length that counts itself but not the
//! tag. A handful of frames that only ever open a connection (startup, TLS and
//! GSS encryption requests, cancel requests) carry no tag at all, and their
//! length counts the whole frame.
//!
//! Tag bytes are reused across directions and connection phases (`S` is both
//! the frontend Sync and the backend ParameterStatus, `R` covers every
//! authentication request), so a [`Frame`] only records the tag; callers
//! interpret it knowing which side of the connection it came from.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Connection parameters carried by a startup message
pub type ConnectionParams = HashMap<String, String>;

/// Protocol version 3.0, the only version the proxy speaks
pub const PROTOCOL_VERSION_3: u32 = 196_608;

/// Request code of an SSLRequest
pub const SSL_REQUEST_CODE: u32 = 80_877_103;

/// Request code of a GSSENCRequest
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;

/// Request code of a CancelRequest
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Reply to an SSLRequest or GSSENCRequest refusing encryption
pub const ENCRYPTION_REFUSED: u8 = b'N';

/// Message tags
pub mod tags {
    // Frontend
    /// Simple query
    pub const QUERY: u8 = b'Q';
    /// Terminate
    pub const TERMINATE: u8 = b'X';
    /// Password, SASLInitialResponse and SASLResponse
    pub const PASSWORD: u8 = b'p';
    /// Sync (extended query protocol)
    pub const SYNC: u8 = b'S';
    /// Flush (extended query protocol)
    pub const FLUSH: u8 = b'H';
    /// Function call
    pub const FUNCTION_CALL: u8 = b'F';

    // Backend
    /// Any authentication request
    pub const AUTHENTICATION: u8 = b'R';
    /// ParameterStatus
    pub const PARAMETER_STATUS: u8 = b'S';
    /// BackendKeyData
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// ReadyForQuery
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// NoticeResponse
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// ErrorResponse
    pub const ERROR_RESPONSE: u8 = b'E';
    /// NegotiateProtocolVersion
    pub const NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';
}

/// Authentication request codes carried in an `R` message
pub mod auth {
    /// Authentication successful
    pub const OK: u32 = 0;
    /// Cleartext password required
    pub const CLEARTEXT_PASSWORD: u32 = 3;
    /// MD5 password required
    pub const MD5_PASSWORD: u32 = 5;
    /// SASL authentication required
    pub const SASL: u32 = 10;
    /// SASL continuation
    pub const SASL_CONTINUE: u32 = 11;
    /// SASL final
    pub const SASL_FINAL: u32 = 12;
}

/// What a decoded frame is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A regular frame starting with a type tag
    Tagged(u8),

    /// StartupMessage (untagged)
    Startup,

    /// SSLRequest (untagged, 8 bytes)
    SslRequest,

    /// GSSENCRequest (untagged, 8 bytes)
    GssEncRequest,

    /// CancelRequest (untagged, 16 bytes)
    CancelRequest,
}

impl FrameKind {
    /// Whether the frame starts with a tag byte
    pub fn is_tagged(self) -> bool {
        matches!(self, FrameKind::Tagged(_))
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Tagged(tag) => {
                let name = match *tag {
                    tags::QUERY => "Query",
                    tags::TERMINATE => "Terminate",
                    tags::PASSWORD => "Password",
                    tags::AUTHENTICATION => "Authentication",
                    tags::PARAMETER_STATUS => "ParameterStatus/Sync",
                    tags::READY_FOR_QUERY => "ReadyForQuery",
                    tags::NOTICE_RESPONSE => "Notice",
                    tags::ERROR_RESPONSE => "ErrorResponse/Execute",
                    tags::BACKEND_KEY_DATA => "BackendKeyData",
                    _ => "Message",
                };
                if tag.is_ascii_graphic() {
                    write!(f, "{}({})", name, *tag as char)
                } else {
                    write!(f, "{}(0x{:02X})", name, tag)
                }
            }
            FrameKind::Startup => write!(f, "Startup"),
            FrameKind::SslRequest => write!(f, "SSLRequest"),
            FrameKind::GssEncRequest => write!(f, "GSSENCRequest"),
            FrameKind::CancelRequest => write!(f, "CancelRequest"),
        }
    }
}

/// One complete protocol message exactly as it appeared on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame classification
    kind: FrameKind,

    /// Declared length field (excludes the tag byte when there is one)
    length: u32,

    /// Wire-exact bytes, tag and length included
    raw: Bytes,
}

impl Frame {
    /// Wrap already-validated wire bytes
    pub(crate) fn new(kind: FrameKind, length: u32, raw: Bytes) -> Self {
        Self { kind, length, raw }
    }

    /// Frame classification
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Tag byte, if the frame is tagged
    pub fn tag(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Tagged(tag) => Some(tag),
            _ => None,
        }
    }

    /// Whether this is a tagged frame with the given tag
    pub fn is(&self, tag: u8) -> bool {
        self.kind == FrameKind::Tagged(tag)
    }

    /// Whether this is a Terminate frame
    pub fn is_terminate(&self) -> bool {
        self.is(tags::TERMINATE)
    }

    /// Declared length field
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Wire-exact bytes
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Bytes following the tag and length fields
    ///
    /// For untagged frames this starts with the 4-byte request code or
    /// protocol version.
    pub fn body(&self) -> &[u8] {
        let header = if self.kind.is_tagged() { 5 } else { 4 };
        &self.raw[header..]
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} len={}", self.kind, self.length)
    }
}

/// Transaction status reported in ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction)
    Idle,

    /// In a transaction block
    InTransaction,

    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Convert from a byte to a transaction status
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    /// Convert to a byte
    pub fn to_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Backend process id and secret key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    /// Backend process id
    pub process_id: i32,

    /// Secret key for cancel requests
    pub secret_key: i32,
}

/// Authentication request sent by a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    /// Authentication successful
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 authentication
        salt: [u8; 4],
    },

    /// SASL authentication required
    Sasl {
        /// Offered SASL mechanisms
        mechanisms: Vec<String>,
    },

    /// SASL continuation
    SaslContinue {
        /// Server challenge
        data: Bytes,
    },

    /// SASL final
    SaslFinal {
        /// Server signature
        data: Bytes,
    },

    /// Any method the proxy does not implement (Kerberos, GSS, SSPI, ...)
    Unsupported(u32),
}

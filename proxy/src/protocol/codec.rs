//! Frame decoder for the PostgreSQL wire protocol
//!
//! This module provides [`FrameDecoder`], a `tokio_util` decoder that splits a
//! byte stream into complete [`Frame`]s without ever repacking their bytes.
//!
//! A client connection opens with untagged frames (startup, SSL and GSS
//! encryption requests, cancel requests) and carries only tagged frames once
//! the startup message has been seen. A decoder built with
//! [`FrameDecoder::startup`] sniffs the first byte of each frame until it has
//! produced a startup frame, then switches to tagged mode for good. Origin
//! connections never send untagged frames, so their decoder is built with
//! [`FrameDecoder::tagged`]; backend tags such as `1`, `2` and `3` are digits
//! and would be misread by the sniffing heuristic.

use crate::error::{ProxyError, Result};
use crate::protocol::message::{
    Frame, FrameKind, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, SSL_REQUEST_CODE,
};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Default cap on a single frame (1 GiB, the server's own limit)
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 30;

/// Cap on a startup message, matching PostgreSQL's limit
pub const MAX_STARTUP_LEN: usize = 10_000;

const TAGGED_HEADER_LEN: usize = 5;
const UNTAGGED_HEADER_LEN: usize = 8;
const REQUEST_LEN: u32 = 8;
const CANCEL_REQUEST_LEN: u32 = 16;

/// Most buffer space reserved ahead of a partially received frame
const RESERVE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Startup,
    Tagged,
}

/// Decoder producing one complete frame at a time
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    /// Framing mode
    mode: Mode,

    /// Largest frame accepted, checked before any allocation
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Decoder for the client side of a connection, starting in startup mode
    pub fn startup() -> Self {
        Self {
            mode: Mode::Startup,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Decoder that only accepts tagged frames
    pub fn tagged() -> Self {
        Self {
            mode: Mode::Tagged,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Override the frame size cap
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Whether the decoder still accepts untagged frames
    pub fn in_startup_mode(&self) -> bool {
        self.mode == Mode::Startup
    }

    /// Largest frame accepted in the current mode
    ///
    /// Before the startup message a client may only send Terminate, so
    /// tagged frames are held to the startup cap until then.
    fn limit(&self) -> usize {
        match self.mode {
            Mode::Startup => self.max_frame_len.min(MAX_STARTUP_LEN),
            Mode::Tagged => self.max_frame_len,
        }
    }

    fn check_limit(&self, length: usize) -> Result<()> {
        let limit = self.limit();
        if length > limit {
            return Err(ProxyError::FrameTooLarge { length, limit });
        }
        Ok(())
    }

    fn decode_tagged(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < TAGGED_HEADER_LEN {
            return Ok(None);
        }

        let tag = src[0];
        let length = read_u32(&src[1..5]);
        if length < 4 {
            return Err(ProxyError::Protocol(format!(
                "invalid length {} for message '{}'",
                length,
                tag.escape_ascii()
            )));
        }
        self.check_limit(length as usize)?;

        let total = length as usize + 1;
        if src.len() < total {
            reserve_towards(src, total);
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        Ok(Some(Frame::new(FrameKind::Tagged(tag), length, raw)))
    }

    fn decode_untagged(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = read_u32(&src[0..4]);
        if (length as usize) < UNTAGGED_HEADER_LEN {
            return Err(ProxyError::Protocol(format!(
                "invalid untagged message length {}",
                length
            )));
        }
        self.check_limit(length as usize)?;

        if src.len() < UNTAGGED_HEADER_LEN {
            return Ok(None);
        }

        let code = read_u32(&src[4..8]);
        let kind = match code {
            SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => {
                if length != REQUEST_LEN {
                    return Err(ProxyError::Protocol(format!(
                        "encryption request with length {}",
                        length
                    )));
                }
                if code == SSL_REQUEST_CODE {
                    FrameKind::SslRequest
                } else {
                    FrameKind::GssEncRequest
                }
            }
            CANCEL_REQUEST_CODE => {
                if length != CANCEL_REQUEST_LEN {
                    return Err(ProxyError::Protocol(format!(
                        "cancel request with length {}",
                        length
                    )));
                }
                FrameKind::CancelRequest
            }
            _ if length == REQUEST_LEN => {
                return Err(ProxyError::Protocol(format!(
                    "unknown request code {}",
                    code
                )));
            }
            _ => {
                if length as usize > MAX_STARTUP_LEN {
                    return Err(ProxyError::FrameTooLarge {
                        length: length as usize,
                        limit: MAX_STARTUP_LEN,
                    });
                }
                if code >> 16 != 3 {
                    return Err(ProxyError::Protocol(format!(
                        "unsupported protocol version {}.{}",
                        code >> 16,
                        code & 0xFFFF
                    )));
                }
                FrameKind::Startup
            }
        };

        let total = length as usize;
        if src.len() < total {
            reserve_towards(src, total);
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        if kind == FrameKind::Startup {
            self.mode = Mode::Tagged;
        }
        Ok(Some(Frame::new(kind, length, raw)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::startup()
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.is_empty() {
            return Ok(None);
        }

        let tagged = match self.mode {
            Mode::Tagged => true,
            // Frontend tags are letters; untagged frames begin with a length
            // whose high byte is zero for any sane size.
            Mode::Startup => src[0].is_ascii_alphabetic(),
        };

        if tagged {
            self.decode_tagged(src)
        } else {
            self.decode_untagged(src)
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProxyError::ConnectionClosed),
        }
    }
}

/// Grow the buffer towards `total` bytes, one bounded step at a time
fn reserve_towards(src: &mut BytesMut, total: usize) {
    src.reserve((total - src.len()).min(RESERVE_CHUNK));
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

//! Message parser for PostgreSQL wire protocol messages
//!
//! Readers for the handful of frames whose contents the proxy has to look at.
//! Everything else is relayed without being parsed. All readers reject
//! truncated or malformed payloads with a [`ProxyError::Protocol`] rather
//! than panicking.

use crate::error::{ProxyError, Result};
use crate::protocol::message::{
    auth, tags, AuthenticationRequest, BackendKeyData, ConnectionParams, Frame, FrameKind,
    TransactionStatus,
};
use bytes::Bytes;
use std::collections::HashMap;

/// Fields of an ErrorResponse or NoticeResponse keyed by field type
pub type ErrorFields = HashMap<char, String>;

/// Cursor over a message body
struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn truncated(&self) -> ProxyError {
        ProxyError::Protocol(format!("truncated {} message", self.what))
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn u8(&mut self) -> Result<u8> {
        let buf = self.buf;
        let (&byte, rest) = buf.split_first().ok_or_else(|| self.truncated())?;
        self.buf = rest;
        Ok(byte)
    }

    fn i32(&mut self) -> Result<i32> {
        let buf = self.buf;
        if buf.len() < 4 {
            return Err(self.truncated());
        }
        let (head, rest) = buf.split_at(4);
        self.buf = rest;
        Ok(i32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let buf = self.buf;
        if buf.len() < n {
            return Err(self.truncated());
        }
        let (head, rest) = buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    /// Null-terminated UTF-8 string
    fn cstr(&mut self) -> Result<&'a str> {
        let buf = self.buf;
        let end = buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| {
                ProxyError::Protocol(format!("missing string terminator in {} message", self.what))
            })?;
        let s = std::str::from_utf8(&buf[..end]).map_err(|_| {
            ProxyError::Protocol(format!("invalid UTF-8 in {} message", self.what))
        })?;
        self.buf = &buf[end + 1..];
        Ok(s)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn finish(&self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(ProxyError::Protocol(format!(
                "{} trailing bytes in {} message",
                self.buf.len(),
                self.what
            )));
        }
        Ok(())
    }
}

fn expect_tag(frame: &Frame, tag: u8, what: &str) -> Result<()> {
    if !frame.is(tag) {
        return Err(ProxyError::Protocol(format!(
            "expected {} message, got {}",
            what,
            frame.kind()
        )));
    }
    Ok(())
}

/// Query text of a simple Query message
pub fn parse_query(frame: &Frame) -> Result<String> {
    expect_tag(frame, tags::QUERY, "Query")?;
    let mut reader = Reader::new(frame.body(), "Query");
    let text = reader.cstr()?;
    reader.finish()?;
    Ok(text.to_string())
}

/// Parameters of a StartupMessage
///
/// The payload after the 8-byte header is a list of `name\0value\0` pairs
/// closed by an empty name, which must be the last byte of the frame.
pub fn parse_startup_parameters(frame: &Frame) -> Result<ConnectionParams> {
    if frame.kind() != FrameKind::Startup {
        return Err(ProxyError::Protocol(format!(
            "expected startup message, got {}",
            frame.kind()
        )));
    }

    // Skip the protocol version
    let mut reader = Reader::new(&frame.body()[4..], "startup");
    let mut params = ConnectionParams::new();

    loop {
        if reader.is_empty() {
            return Err(ProxyError::Protocol(
                "startup parameters are not terminated".to_string(),
            ));
        }
        let name = reader.cstr()?;
        if name.is_empty() {
            break;
        }
        let value = reader.cstr().map_err(|_| {
            ProxyError::Protocol(format!("startup parameter '{}' has no value", name))
        })?;
        params.insert(name.to_string(), value.to_string());
    }

    reader.finish()?;
    Ok(params)
}

/// Authentication request carried by an `R` message
pub fn parse_authentication(frame: &Frame) -> Result<AuthenticationRequest> {
    expect_tag(frame, tags::AUTHENTICATION, "Authentication")?;
    let mut reader = Reader::new(frame.body(), "Authentication");
    let code = reader.i32()? as u32;

    let request = match code {
        auth::OK => AuthenticationRequest::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationRequest::CleartextPassword,
        auth::MD5_PASSWORD => {
            let salt = reader.bytes(4)?;
            AuthenticationRequest::Md5Password {
                salt: [salt[0], salt[1], salt[2], salt[3]],
            }
        }
        auth::SASL => {
            let mut mechanisms = Vec::new();
            loop {
                let mechanism = reader.cstr()?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism.to_string());
            }
            AuthenticationRequest::Sasl { mechanisms }
        }
        auth::SASL_CONTINUE => AuthenticationRequest::SaslContinue {
            data: Bytes::copy_from_slice(reader.rest()),
        },
        auth::SASL_FINAL => AuthenticationRequest::SaslFinal {
            data: Bytes::copy_from_slice(reader.rest()),
        },
        other => return Ok(AuthenticationRequest::Unsupported(other)),
    };

    reader.finish()?;
    Ok(request)
}

/// Name and value of a ParameterStatus message
pub fn parse_parameter_status(frame: &Frame) -> Result<(String, String)> {
    expect_tag(frame, tags::PARAMETER_STATUS, "ParameterStatus")?;
    let mut reader = Reader::new(frame.body(), "ParameterStatus");
    let name = reader.cstr()?.to_string();
    let value = reader.cstr()?.to_string();
    reader.finish()?;
    Ok((name, value))
}

/// Process id and secret key of a BackendKeyData message
pub fn parse_backend_key_data(frame: &Frame) -> Result<BackendKeyData> {
    expect_tag(frame, tags::BACKEND_KEY_DATA, "BackendKeyData")?;
    let mut reader = Reader::new(frame.body(), "BackendKeyData");
    let process_id = reader.i32()?;
    let secret_key = reader.i32()?;
    reader.finish()?;
    Ok(BackendKeyData {
        process_id,
        secret_key,
    })
}

/// Transaction status of a ReadyForQuery message
pub fn parse_ready_for_query(frame: &Frame) -> Result<TransactionStatus> {
    expect_tag(frame, tags::READY_FOR_QUERY, "ReadyForQuery")?;
    let mut reader = Reader::new(frame.body(), "ReadyForQuery");
    let byte = reader.u8()?;
    reader.finish()?;
    TransactionStatus::from_byte(byte).ok_or_else(|| {
        ProxyError::Protocol(format!(
            "unknown transaction status '{}'",
            byte.escape_ascii()
        ))
    })
}

/// Fields of an ErrorResponse or NoticeResponse
pub fn parse_error_fields(frame: &Frame) -> Result<ErrorFields> {
    if !frame.is(tags::ERROR_RESPONSE) && !frame.is(tags::NOTICE_RESPONSE) {
        return Err(ProxyError::Protocol(format!(
            "expected ErrorResponse or NoticeResponse, got {}",
            frame.kind()
        )));
    }

    let mut reader = Reader::new(frame.body(), "ErrorResponse");
    let mut fields = ErrorFields::new();
    loop {
        let field_type = reader.u8()?;
        if field_type == 0 {
            break;
        }
        let value = reader.cstr()?;
        fields.insert(field_type as char, value.to_string());
    }
    reader.finish()?;
    Ok(fields)
}

/// Human-readable summary of an ErrorResponse, e.g. `FATAL 28P01: password authentication failed`
pub fn describe_error(fields: &ErrorFields) -> String {
    let severity = fields.get(&'S').map(String::as_str).unwrap_or("ERROR");
    let code = fields.get(&'C').map(String::as_str).unwrap_or("?????");
    let message = fields.get(&'M').map(String::as_str).unwrap_or("");
    format!("{} {}: {}", severity, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::FrameDecoder;
    use crate::protocol::formatter;
    use bytes::BytesMut;
    use proptest::prelude::*;
    use tokio_util::codec::Decoder;

    fn startup_frame(payload: &[u8]) -> Frame {
        let mut wire = Vec::with_capacity(payload.len() + 8);
        wire.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        wire.extend_from_slice(&196_608u32.to_be_bytes());
        wire.extend_from_slice(payload);
        let mut buf = BytesMut::from(&wire[..]);
        FrameDecoder::startup().decode(&mut buf).unwrap().unwrap()
    }

    fn tagged_frame(bytes: &[u8]) -> Frame {
        let mut buf = BytesMut::from(bytes);
        FrameDecoder::tagged().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_parse_startup_parameters() {
        let frame = startup_frame(b"user\0alice\0database\0mydb\0\0");
        let params = parse_startup_parameters(&frame).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["user"], "alice");
        assert_eq!(params["database"], "mydb");
    }

    #[test]
    fn test_startup_missing_terminator() {
        let frame = startup_frame(b"user\0alice\0");
        assert!(parse_startup_parameters(&frame).is_err());
    }

    #[test]
    fn test_startup_odd_count() {
        let frame = startup_frame(b"user\0alice\0database\0");
        assert!(parse_startup_parameters(&frame).is_err());
    }

    #[test]
    fn test_startup_trailing_bytes() {
        let frame = startup_frame(b"user\0alice\0\0junk");
        assert!(parse_startup_parameters(&frame).is_err());
    }

    #[test]
    fn test_startup_invalid_utf8() {
        let frame = startup_frame(b"user\0\xff\xfe\0\0");
        assert!(parse_startup_parameters(&frame).is_err());
    }

    #[test]
    fn test_parse_query_rejects_other_kinds() {
        let frame = tagged_frame(&formatter::terminate());
        assert!(matches!(parse_query(&frame), Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_parse_md5_authentication() {
        let frame = tagged_frame(b"R\0\0\0\x0c\0\0\0\x05\x01\x02\x03\x04");
        assert_eq!(
            parse_authentication(&frame).unwrap(),
            AuthenticationRequest::Md5Password {
                salt: [1, 2, 3, 4]
            }
        );
    }

    #[test]
    fn test_parse_sasl_mechanisms() {
        let body = b"\0\0\0\x0aSCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0";
        let mut wire = vec![b'R'];
        wire.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        wire.extend_from_slice(body);
        let frame = tagged_frame(&wire);
        assert_eq!(
            parse_authentication(&frame).unwrap(),
            AuthenticationRequest::Sasl {
                mechanisms: vec!["SCRAM-SHA-256-PLUS".to_string(), "SCRAM-SHA-256".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_backend_key_data() {
        let frame = tagged_frame(b"K\0\0\0\x0c\0\0\0\x2a\0\0\0\x07");
        let key = parse_backend_key_data(&frame).unwrap();
        assert_eq!(key.process_id, 42);
        assert_eq!(key.secret_key, 7);
    }

    #[test]
    fn test_truncated_backend_key_data() {
        let frame = tagged_frame(b"K\0\0\0\x08\0\0\0\x2a");
        assert!(parse_backend_key_data(&frame).is_err());
    }

    #[test]
    fn test_describe_error() {
        let frame = tagged_frame(&formatter::error_response(
            "FATAL",
            "28P01",
            "password authentication failed",
        ));
        let fields = parse_error_fields(&frame).unwrap();
        assert_eq!(
            describe_error(&fields),
            "FATAL 28P01: password authentication failed"
        );
    }

    proptest! {
        #[test]
        fn prop_startup_parameters_round_trip(
            params in proptest::collection::hash_map("[a-z_]{1,12}", "[a-zA-Z0-9 ._-]{0,24}", 0..8)
        ) {
            let bytes = formatter::startup(&params);
            let mut buf = BytesMut::from(&bytes[..]);
            let frame = FrameDecoder::startup().decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(parse_startup_parameters(&frame).unwrap(), params);
        }

        #[test]
        fn prop_startup_parser_never_panics(payload in proptest::collection::vec(any::<u8>(), 1..256)) {
            let frame = startup_frame(&payload);
            let _ = parse_startup_parameters(&frame);
        }
    }
}

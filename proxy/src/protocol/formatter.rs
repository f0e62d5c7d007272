//! Message formatter for PostgreSQL wire protocol messages
//!
//! This module provides constructors for every message the proxy originates
//! itself: the synthetic handshake it plays towards clients, and the startup
//! and authentication messages it sends when logging in to an origin. Length
//! fields are always computed from the bytes actually written.

use crate::protocol::message::{
    tags, ConnectionParams, TransactionStatus, PROTOCOL_VERSION_3, SSL_REQUEST_CODE,
};
use bytes::{BufMut, Bytes, BytesMut};

/// AuthenticationOk
pub fn authentication_ok() -> Bytes {
    write_message_with_type(tags::AUTHENTICATION, |buf| {
        buf.put_i32(0);
    })
}

/// ParameterStatus
pub fn parameter_status(name: &str, value: &str) -> Bytes {
    write_message_with_type(tags::PARAMETER_STATUS, |buf| {
        write_string(buf, name);
        write_string(buf, value);
    })
}

/// ReadyForQuery
pub fn ready_for_query(status: TransactionStatus) -> Bytes {
    write_message_with_type(tags::READY_FOR_QUERY, |buf| {
        buf.put_u8(status.to_byte());
    })
}

/// NoticeResponse carrying only a message field
pub fn notice(message: &str) -> Bytes {
    write_message_with_type(tags::NOTICE_RESPONSE, |buf| {
        buf.put_u8(b'M');
        write_string(buf, message);
        buf.put_u8(0);
    })
}

/// ErrorResponse with severity, SQLSTATE code and message fields
pub fn error_response(severity: &str, code: &str, message: &str) -> Bytes {
    write_message_with_type(tags::ERROR_RESPONSE, |buf| {
        buf.put_u8(b'S');
        write_string(buf, severity);
        buf.put_u8(b'V');
        write_string(buf, severity);
        buf.put_u8(b'C');
        write_string(buf, code);
        buf.put_u8(b'M');
        write_string(buf, message);
        buf.put_u8(0);
    })
}

/// Simple Query
pub fn query(text: &str) -> Bytes {
    write_message_with_type(tags::QUERY, |buf| {
        write_string(buf, text);
    })
}

/// Terminate
pub fn terminate() -> Bytes {
    write_message_with_type(tags::TERMINATE, |_| {})
}

/// PasswordMessage (cleartext or MD5-hashed)
pub fn password(password: &str) -> Bytes {
    write_message_with_type(tags::PASSWORD, |buf| {
        write_string(buf, password);
    })
}

/// SASLInitialResponse
pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> Bytes {
    write_message_with_type(tags::PASSWORD, |buf| {
        write_string(buf, mechanism);
        buf.put_i32(data.len() as i32);
        buf.put_slice(data);
    })
}

/// SASLResponse
pub fn sasl_response(data: &[u8]) -> Bytes {
    write_message_with_type(tags::PASSWORD, |buf| {
        buf.put_slice(data);
    })
}

/// SSLRequest
pub fn ssl_request() -> Bytes {
    write_untagged(|buf| {
        buf.put_u32(SSL_REQUEST_CODE);
    })
}

/// StartupMessage for protocol 3.0
///
/// `user` is written first when present; the remaining parameters follow in
/// name order so the output is stable.
pub fn startup(params: &ConnectionParams) -> Bytes {
    let mut names: Vec<&String> = params.keys().filter(|name| *name != "user").collect();
    names.sort();

    write_untagged(|buf| {
        buf.put_u32(PROTOCOL_VERSION_3);
        if let Some(user) = params.get("user") {
            write_string(buf, "user");
            write_string(buf, user);
        }
        for name in names {
            write_string(buf, name);
            write_string(buf, &params[name]);
        }
        buf.put_u8(0);
    })
}

/// Write a tagged message; the length counts itself but not the tag
fn write_message_with_type<F>(type_code: u8, writer: F) -> Bytes
where
    F: FnOnce(&mut BytesMut),
{
    let mut buffer = BytesMut::with_capacity(16);
    buffer.put_u8(type_code);
    buffer.put_u32(0); // Placeholder

    writer(&mut buffer);

    let length = (buffer.len() - 1) as u32;
    buffer[1..5].copy_from_slice(&length.to_be_bytes());
    buffer.freeze()
}

/// Write an untagged message; the length counts the whole frame
fn write_untagged<F>(writer: F) -> Bytes
where
    F: FnOnce(&mut BytesMut),
{
    let mut buffer = BytesMut::with_capacity(64);
    buffer.put_u32(0); // Placeholder

    writer(&mut buffer);

    let length = buffer.len() as u32;
    buffer[0..4].copy_from_slice(&length.to_be_bytes());
    buffer.freeze()
}

/// Write a null-terminated string
fn write_string(buffer: &mut BytesMut, string: &str) {
    buffer.put_slice(string.as_bytes());
    buffer.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::FrameDecoder;
    use crate::protocol::message::{Frame, FrameKind};
    use crate::protocol::parser;
    use tokio_util::codec::Decoder;

    fn decode(bytes: &Bytes) -> Frame {
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::tagged().decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        frame
    }

    #[test]
    fn test_authentication_ok_bytes() {
        let bytes = authentication_ok();
        assert_eq!(bytes.as_ref(), &[b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
        let frame = decode(&bytes);
        assert_eq!(frame.raw(), &bytes);
        assert_eq!(frame.length(), 8);
    }

    #[test]
    fn test_parameter_status_round_trip() {
        let bytes = parameter_status("client_encoding", "UTF8");
        let frame = decode(&bytes);
        assert_eq!(frame.length() as usize, bytes.len() - 1);
        let (name, value) = parser::parse_parameter_status(&frame).unwrap();
        assert_eq!(name, "client_encoding");
        assert_eq!(value, "UTF8");
    }

    #[test]
    fn test_ready_for_query_round_trip() {
        for status in [
            TransactionStatus::Idle,
            TransactionStatus::InTransaction,
            TransactionStatus::Failed,
        ] {
            let frame = decode(&ready_for_query(status));
            assert_eq!(frame.length(), 5);
            assert_eq!(parser::parse_ready_for_query(&frame).unwrap(), status);
        }
    }

    #[test]
    fn test_notice_layout() {
        let bytes = notice("hi");
        assert_eq!(bytes.as_ref(), b"N\0\0\0\x09Mhi\0\0");
        let fields = parser::parse_error_fields(&decode(&bytes)).unwrap();
        assert_eq!(fields.get(&'M').map(String::as_str), Some("hi"));
    }

    #[test]
    fn test_error_response_fields() {
        let bytes = error_response("FATAL", "3D000", "no route");
        let frame = decode(&bytes);
        assert!(frame.is(tags::ERROR_RESPONSE));
        let fields = parser::parse_error_fields(&frame).unwrap();
        assert_eq!(fields[&'S'], "FATAL");
        assert_eq!(fields[&'C'], "3D000");
        assert_eq!(fields[&'M'], "no route");
    }

    #[test]
    fn test_query_and_terminate() {
        let frame = decode(&query("SELECT 1"));
        assert_eq!(parser::parse_query(&frame).unwrap(), "SELECT 1");
        assert_eq!(terminate().as_ref(), b"X\0\0\0\x04");
    }

    #[test]
    fn test_ssl_request_bytes() {
        assert_eq!(
            ssl_request().as_ref(),
            &[0, 0, 0, 8, 0x04, 0xD2, 0x16, 0x2F]
        );
    }

    #[test]
    fn test_startup_round_trip() {
        let mut params = ConnectionParams::new();
        params.insert("user".to_string(), "alice".to_string());
        params.insert("database".to_string(), "mydb".to_string());
        params.insert("application_name".to_string(), "psql".to_string());

        let bytes = startup(&params);
        assert_eq!(&bytes[8..18], b"user\0alice");

        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::startup().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind(), FrameKind::Startup);
        assert_eq!(parser::parse_startup_parameters(&frame).unwrap(), params);
    }

    #[test]
    fn test_sasl_initial_response_layout() {
        let bytes = sasl_initial_response("SCRAM-SHA-256", b"n,,n=,r=abc");
        let frame = decode(&bytes);
        assert!(frame.is(tags::PASSWORD));
        let body = frame.body();
        assert_eq!(&body[..14], b"SCRAM-SHA-256\0");
        assert_eq!(&body[14..18], &11i32.to_be_bytes());
        assert_eq!(&body[18..], b"n,,n=,r=abc");
    }
}

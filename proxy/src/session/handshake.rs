//! Client startup handshake
//!
//! The proxy answers the client's startup sequence itself: encryption
//! requests are refused, the startup parameters are routed to an origin, a
//! pooled origin connection is acquired, and the client is told it has been
//! authenticated. Client-facing authentication is not performed.

use crate::error::{to_pg_error, ProxyError, Result};
use crate::origin::{OriginPools, PooledOrigin};
use crate::protocol::message::ENCRYPTION_REFUSED;
use crate::protocol::{
    formatter, parser, ConnectionParams, FrameDecoder, FrameKind, TransactionStatus,
};
use crate::routing::Router;
use bytes::BytesMut;
use futures_util::StreamExt;
use log::{debug, info};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use uuid::Uuid;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing received yet
    AwaitFirstMessage,

    /// An encryption request was refused; the startup message comes next
    TlsDeclined,

    /// Startup message received; routing and acquiring an origin
    Routing,

    /// Origin connection checked out, greeting not yet sent
    OriginAcquired,

    /// Client greeted; the session can relay
    Ready,

    /// The client left before the session was ready
    Closed,

    /// The handshake failed
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a handshake ended
pub enum HandshakeOutcome {
    /// The client is greeted and an origin is checked out
    Ready {
        /// The checked-out origin
        origin: PooledOrigin,

        /// The client's startup parameters
        params: ConnectionParams,
    },

    /// The client ended the connection (Terminate, cancel request or EOF)
    Closed,
}

impl fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeOutcome::Ready { origin, .. } => {
                write!(f, "Ready({})", origin.connection().addr())
            }
            HandshakeOutcome::Closed => write!(f, "Closed"),
        }
    }
}

/// Handshake state machine for one client
pub struct Handshake<'a, R, W> {
    /// Session id for logging
    session: Uuid,

    /// Client frames
    frames: &'a mut FramedRead<R, FrameDecoder>,

    /// Client write side
    writer: &'a mut W,

    /// Current state
    state: HandshakeState,

    /// Parameter statuses sent when the origin did not report them
    default_parameters: &'a [(String, String)],
}

impl<'a, R, W> Handshake<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a handshake over a client connection
    pub fn new(
        session: Uuid,
        frames: &'a mut FramedRead<R, FrameDecoder>,
        writer: &'a mut W,
        default_parameters: &'a [(String, String)],
    ) -> Self {
        Self {
            session,
            frames,
            writer,
            state: HandshakeState::AwaitFirstMessage,
            default_parameters,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drive the handshake to completion
    ///
    /// Failures are reported to the client with a FATAL ErrorResponse, as far
    /// as the client socket still accepts writes, before the error is returned.
    pub async fn run(&mut self, router: &Router, pools: &OriginPools) -> Result<HandshakeOutcome> {
        match self.drive(router, pools).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.state = HandshakeState::Failed;
                self.report(&e).await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self, router: &Router, pools: &OriginPools) -> Result<HandshakeOutcome> {
        loop {
            let frame = match self.frames.next().await {
                Some(frame) => frame?,
                None => {
                    debug!("[{}] Client closed during {}", self.session, self.state);
                    self.state = HandshakeState::Closed;
                    return Ok(HandshakeOutcome::Closed);
                }
            };

            match frame.kind() {
                FrameKind::SslRequest | FrameKind::GssEncRequest => {
                    debug!("[{}] Refusing {}", self.session, frame.kind());
                    self.writer.write_all(&[ENCRYPTION_REFUSED]).await?;
                    self.writer.flush().await?;
                    self.state = HandshakeState::TlsDeclined;
                }
                FrameKind::CancelRequest => {
                    info!("[{}] Cancel requests are not supported, closing", self.session);
                    self.state = HandshakeState::Closed;
                    return Ok(HandshakeOutcome::Closed);
                }
                FrameKind::Startup => {
                    self.state = HandshakeState::Routing;
                    let params = parser::parse_startup_parameters(&frame)?;
                    debug!("[{}] Startup parameters: {:?}", self.session, params);

                    let target = router.route(&params)?;
                    let origin = pools.acquire(&target).await?;
                    self.state = HandshakeState::OriginAcquired;
                    info!(
                        "[{}] Routed user={} database={} to '{}' ({})",
                        self.session,
                        params.get("user").map(String::as_str).unwrap_or(""),
                        params.get("database").map(String::as_str).unwrap_or(""),
                        target.name(),
                        origin.connection().addr()
                    );

                    self.greet(&origin).await?;
                    self.state = HandshakeState::Ready;
                    return Ok(HandshakeOutcome::Ready { origin, params });
                }
                FrameKind::Tagged(_) if frame.is_terminate() => {
                    debug!("[{}] Client terminated during {}", self.session, self.state);
                    self.state = HandshakeState::Closed;
                    return Ok(HandshakeOutcome::Closed);
                }
                FrameKind::Tagged(_) => {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected {} before startup",
                        frame.kind()
                    )));
                }
            }
        }
    }

    /// AuthenticationOk, parameter statuses, a notice naming the origin, ReadyForQuery
    async fn greet(&mut self, origin: &PooledOrigin) -> Result<()> {
        let connection = origin.connection();
        let mut greeting = BytesMut::new();
        greeting.extend_from_slice(&formatter::authentication_ok());

        for (name, value) in connection.parameters() {
            greeting.extend_from_slice(&formatter::parameter_status(name, value));
        }
        for (name, value) in self.default_parameters {
            if !connection.parameters().iter().any(|(reported, _)| reported == name) {
                greeting.extend_from_slice(&formatter::parameter_status(name, value));
            }
        }

        greeting.extend_from_slice(&formatter::notice(&format!(
            "PGPROXY: proxy successfully connected through to remote at: {}",
            connection.addr()
        )));
        greeting.extend_from_slice(&formatter::ready_for_query(TransactionStatus::Idle));

        self.writer.write_all(&greeting).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn report(&mut self, error: &ProxyError) {
        let (code, message) = to_pg_error(error);
        let response = formatter::error_response("FATAL", &code, &message);
        if let Err(e) = self.writer.write_all(&response).await {
            debug!("[{}] Could not report error to client: {}", self.session, e);
            return;
        }
        let _ = self.writer.flush().await;
    }
}

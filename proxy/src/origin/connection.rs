//! Authenticated connections to origin databases
//!
//! This module provides [`OriginConnection`], a TCP connection that has
//! completed the PostgreSQL startup exchange with an origin server, and
//! [`OriginSettings`], the connection parameters a credential provider
//! resolves for it.

use crate::error::{ProxyError, Result};
use crate::protocol::message::tags;
use crate::protocol::parser::{self, describe_error};
use crate::protocol::{
    formatter, AuthenticationRequest, BackendKeyData, ConnectionParams, Frame, FrameDecoder,
    TransactionStatus,
};
use futures_util::StreamExt;
use log::{debug, info, warn};
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_postgres::config::{Host, SslMode};
use tokio_util::codec::FramedRead;

/// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// Where and as whom to connect to an origin
#[derive(Clone, PartialEq, Eq)]
pub struct OriginSettings {
    /// Host name or IP address
    pub host: String,

    /// TCP port
    pub port: u16,

    /// Login role
    pub user: String,

    /// Password, if the origin asks for one
    pub password: Option<String>,

    /// Database to connect to (defaults to the user name on the server)
    pub database: Option<String>,

    /// application_name reported to the origin
    pub application_name: Option<String>,

    /// Bound on TCP connect plus login
    pub connect_timeout: Duration,
}

impl OriginSettings {
    /// Parse a `postgres://` URL or a `key=value` connection string
    ///
    /// Only the first host is used. Unix socket hosts and `sslmode=require`
    /// are rejected since the proxy speaks plain TCP to its origins.
    pub fn from_url(url: &str, default_timeout: Duration) -> Result<Self> {
        let config = url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| ProxyError::Config(format!("invalid origin URL: {}", e)))?;

        if matches!(config.get_ssl_mode(), SslMode::Require) {
            return Err(ProxyError::Config(
                "origin URL requires TLS, which is not supported".to_string(),
            ));
        }

        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            Some(_) => {
                return Err(ProxyError::Config(
                    "unix socket origins are not supported".to_string(),
                ))
            }
            None => "localhost".to_string(),
        };
        let port = config.get_ports().first().copied().unwrap_or(DEFAULT_PORT);
        let user = config
            .get_user()
            .ok_or_else(|| ProxyError::Config("origin URL does not name a user".to_string()))?
            .to_string();
        let password = config
            .get_password()
            .map(|p| String::from_utf8(p.to_vec()))
            .transpose()
            .map_err(|_| ProxyError::Config("origin password is not UTF-8".to_string()))?;

        Ok(Self {
            host,
            port,
            user,
            password,
            database: config.get_dbname().map(str::to_string),
            application_name: config.get_application_name().map(str::to_string),
            connect_timeout: config.get_connect_timeout().copied().unwrap_or(default_timeout),
        })
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Startup parameters sent to the origin
    pub fn startup_params(&self) -> ConnectionParams {
        let mut params = ConnectionParams::new();
        params.insert("user".to_string(), self.user.clone());
        if let Some(database) = &self.database {
            params.insert("database".to_string(), database.clone());
        }
        params.insert(
            "application_name".to_string(),
            self.application_name
                .clone()
                .unwrap_or_else(|| "pgproxy".to_string()),
        );
        params
    }
}

impl fmt::Debug for OriginSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// What an origin reported while the connection was being set up
#[derive(Debug, Clone)]
pub struct OriginInfo {
    /// Peer address
    pub addr: SocketAddr,

    /// ParameterStatus values, in the order they were reported
    pub parameters: Vec<(String, String)>,

    /// BackendKeyData, if the origin sent it
    pub backend_key: Option<BackendKeyData>,
}

/// A logged-in connection to an origin, idle at a ReadyForQuery boundary
#[derive(Debug)]
pub struct OriginConnection {
    stream: TcpStream,
    info: OriginInfo,
}

impl OriginConnection {
    /// Connect to an origin and log in
    pub async fn establish(settings: &OriginSettings) -> Result<Self> {
        let address = settings.address();
        timeout(settings.connect_timeout, Self::connect_and_login(settings))
            .await
            .map_err(|_| ProxyError::Timeout(format!("connecting to origin {}", address)))?
    }

    async fn connect_and_login(settings: &OriginSettings) -> Result<Self> {
        let address = settings.address();
        debug!("Connecting to origin {}", address);

        let mut stream = TcpStream::connect((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| {
                ProxyError::Connection(format!("failed to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;

        let (parameters, backend_key) = {
            let (read, mut write) = stream.split();
            let mut frames = FramedRead::new(read, FrameDecoder::tagged());

            write
                .write_all(&formatter::startup(&settings.startup_params()))
                .await?;
            authenticate(&mut frames, &mut write, settings).await?;
            let session = read_session_setup(&mut frames).await?;

            if !frames.read_buffer().is_empty() {
                return Err(ProxyError::Protocol(
                    "origin sent data after ReadyForQuery".to_string(),
                ));
            }
            session
        };

        info!(
            "Logged in to origin {} as {} ({} parameters)",
            addr,
            settings.user,
            parameters.len()
        );

        Ok(Self {
            stream,
            info: OriginInfo {
                addr,
                parameters,
                backend_key,
            },
        })
    }

    /// Wrap a stream that has already completed its startup exchange
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            info: OriginInfo {
                addr,
                parameters: Vec::new(),
                backend_key: None,
            },
        })
    }

    /// Reassemble a connection taken apart with [`OriginConnection::into_parts`]
    pub fn from_parts(stream: TcpStream, info: OriginInfo) -> Self {
        Self { stream, info }
    }

    /// Take the connection apart
    pub fn into_parts(self) -> (TcpStream, OriginInfo) {
        (self.stream, self.info)
    }

    /// Peer address
    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    /// ParameterStatus values reported at login
    pub fn parameters(&self) -> &[(String, String)] {
        &self.info.parameters
    }

    /// BackendKeyData reported at login
    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.info.backend_key
    }

    /// Whether an idle connection has been closed or has sent something unprompted
    ///
    /// An origin that shuts down sends a FATAL ErrorResponse and closes the
    /// socket; either way the connection cannot be handed out again.
    pub fn is_stale(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Ok(_) | Err(_) => true,
        }
    }

    /// Send Terminate and close the socket
    pub async fn close(mut self) {
        let addr = self.info.addr;
        let closed = timeout(Duration::from_secs(1), async {
            self.stream.write_all(&formatter::terminate()).await?;
            self.stream.shutdown().await
        })
        .await;
        if let Ok(Err(e)) = closed {
            debug!("Error closing origin {}: {}", addr, e);
        }
    }

    /// Run `query` and wait for the origin to become idle again
    pub async fn reset(&mut self, query: &str, limit: Duration) -> Result<()> {
        let addr = self.info.addr;
        timeout(limit, self.run_reset(query))
            .await
            .map_err(|_| ProxyError::Timeout(format!("resetting origin {}", addr)))?
    }

    async fn run_reset(&mut self, query: &str) -> Result<()> {
        let (read, mut write) = self.stream.split();
        write.write_all(&formatter::query(query)).await?;

        let mut frames = FramedRead::new(read, FrameDecoder::tagged());
        let mut failure = None;
        let status = loop {
            let frame = next_frame(&mut frames).await?;
            match frame.tag() {
                Some(tags::ERROR_RESPONSE) => {
                    failure = Some(describe_error(&parser::parse_error_fields(&frame)?));
                }
                Some(tags::READY_FOR_QUERY) => break parser::parse_ready_for_query(&frame)?,
                _ => {}
            }
        };

        if !frames.read_buffer().is_empty() {
            return Err(ProxyError::Protocol(
                "origin sent data after ReadyForQuery".to_string(),
            ));
        }
        if let Some(failure) = failure {
            return Err(ProxyError::Connection(format!(
                "reset query failed: {}",
                failure
            )));
        }
        if status != TransactionStatus::Idle {
            return Err(ProxyError::InvalidState(format!(
                "origin not idle after reset ({:?})",
                status
            )));
        }
        Ok(())
    }
}

async fn next_frame<R>(frames: &mut FramedRead<R, FrameDecoder>) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    match frames.next().await {
        Some(frame) => frame,
        None => Err(ProxyError::ConnectionClosed),
    }
}

/// Answer authentication requests until AuthenticationOk
async fn authenticate<R>(
    frames: &mut FramedRead<R, FrameDecoder>,
    write: &mut WriteHalf<'_>,
    settings: &OriginSettings,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut scram: Option<ScramSha256> = None;

    loop {
        let frame = next_frame(frames).await?;
        match frame.tag() {
            Some(tags::AUTHENTICATION) => {}
            Some(tags::ERROR_RESPONSE) => {
                let fields = parser::parse_error_fields(&frame)?;
                return Err(ProxyError::Auth(format!(
                    "origin rejected login: {}",
                    describe_error(&fields)
                )));
            }
            Some(tags::NEGOTIATE_PROTOCOL_VERSION) => {
                debug!("Origin negotiated protocol version, continuing");
                continue;
            }
            _ => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected {} during origin authentication",
                    frame.kind()
                )))
            }
        }

        match parser::parse_authentication(&frame)? {
            AuthenticationRequest::Ok => return Ok(()),
            AuthenticationRequest::CleartextPassword => {
                debug!("Origin requested cleartext password");
                let password = required_password(settings)?;
                write.write_all(&formatter::password(password)).await?;
            }
            AuthenticationRequest::Md5Password { salt } => {
                debug!("Origin requested MD5 password");
                let password = required_password(settings)?;
                let hashed = md5_password(&settings.user, password, &salt);
                write.write_all(&formatter::password(&hashed)).await?;
            }
            AuthenticationRequest::Sasl { mechanisms } => {
                debug!("Origin offered SASL mechanisms {:?}", mechanisms);
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(ProxyError::Auth(format!(
                        "no supported SASL mechanism in {:?}",
                        mechanisms
                    )));
                }
                let password = required_password(settings)?;
                let client = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                write
                    .write_all(&formatter::sasl_initial_response(
                        SCRAM_SHA_256,
                        client.message(),
                    ))
                    .await?;
                scram = Some(client);
            }
            AuthenticationRequest::SaslContinue { data } => {
                let client = scram.as_mut().ok_or_else(|| {
                    ProxyError::Protocol("SASL continue without SASL start".to_string())
                })?;
                client
                    .update(&data)
                    .map_err(|e| ProxyError::Auth(format!("SCRAM exchange failed: {}", e)))?;
                write
                    .write_all(&formatter::sasl_response(client.message()))
                    .await?;
            }
            AuthenticationRequest::SaslFinal { data } => {
                let mut client = scram.take().ok_or_else(|| {
                    ProxyError::Protocol("SASL final without SASL start".to_string())
                })?;
                client
                    .finish(&data)
                    .map_err(|e| ProxyError::Auth(format!("origin signature invalid: {}", e)))?;
            }
            AuthenticationRequest::Unsupported(code) => {
                return Err(ProxyError::Auth(format!(
                    "unsupported origin authentication method {}",
                    code
                )));
            }
        }
    }
}

/// Collect parameter statuses and key data until the first ReadyForQuery
async fn read_session_setup<R>(
    frames: &mut FramedRead<R, FrameDecoder>,
) -> Result<(Vec<(String, String)>, Option<BackendKeyData>)>
where
    R: AsyncRead + Unpin,
{
    let mut parameters = Vec::new();
    let mut backend_key = None;

    loop {
        let frame = next_frame(frames).await?;
        match frame.tag() {
            Some(tags::PARAMETER_STATUS) => {
                parameters.push(parser::parse_parameter_status(&frame)?);
            }
            Some(tags::BACKEND_KEY_DATA) => {
                backend_key = Some(parser::parse_backend_key_data(&frame)?);
            }
            Some(tags::NOTICE_RESPONSE) => {
                let fields = parser::parse_error_fields(&frame)?;
                warn!("Origin notice during login: {}", describe_error(&fields));
            }
            Some(tags::ERROR_RESPONSE) => {
                let fields = parser::parse_error_fields(&frame)?;
                return Err(ProxyError::Connection(format!(
                    "origin refused session: {}",
                    describe_error(&fields)
                )));
            }
            Some(tags::READY_FOR_QUERY) => {
                parser::parse_ready_for_query(&frame)?;
                return Ok((parameters, backend_key));
            }
            _ => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected {} during origin session setup",
                    frame.kind()
                )))
            }
        }
    }
}

fn required_password(settings: &OriginSettings) -> Result<&str> {
    settings.password.as_deref().ok_or_else(|| {
        ProxyError::Auth(format!(
            "origin {} requested a password but none is configured",
            settings.address()
        ))
    })
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut inner = md5::Context::new();
    inner.consume(password.as_bytes());
    inner.consume(user.as_bytes());
    let inner = format!("{:x}", inner.compute());

    let mut outer = md5::Context::new();
    outer.consume(inner.as_bytes());
    outer.consume(salt);
    format!("md5{:x}", outer.compute())
}

//! Client sessions
//!
//! A session owns one accepted client connection from the first byte to the
//! final shutdown: it runs the startup handshake, relays frames once an
//! origin is checked out, and finally returns that origin to its pool or
//! closes it.

/// Startup handshake state machine
pub mod handshake;

/// Bidirectional frame relay
pub mod relay;

pub use self::handshake::{Handshake, HandshakeOutcome, HandshakeState};
pub use self::relay::{relay, RelayReport, RelaySettings, ReleaseVerdict};

use crate::config::ProxyConfig;
use crate::error::{to_pg_error, ProxyError, Result};
use crate::origin::{OriginConnection, OriginPools, PoolLease};
use crate::protocol::{formatter, FrameDecoder};
use crate::routing::Router;
use crate::stats;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use uuid::Uuid;

/// State shared by every session of a server
pub struct SessionContext {
    /// Proxy configuration
    pub config: ProxyConfig,

    /// Routing table
    pub router: Router,

    /// Origin pools, one per routing target
    pub pools: OriginPools,
}

impl SessionContext {
    /// Create a context
    pub fn new(config: ProxyConfig, router: Router) -> Self {
        let pools = OriginPools::new(config.pool.clone());
        Self {
            config,
            router,
            pools,
        }
    }

    fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            idle_timeout: self.config.idle_timeout,
            write_timeout: self.config.write_timeout,
            max_frame_len: self.config.max_frame_len,
        }
    }
}

/// Serve one client connection to completion
///
/// Errors are logged here; a failing session never affects other sessions.
pub async fn run_session(context: Arc<SessionContext>, client: TcpStream, peer: SocketAddr) {
    let session = Uuid::new_v4();
    stats::session_opened();
    info!("[{}] New client connection from {}", session, peer);

    match serve(&context, session, client).await {
        Ok(()) => debug!("[{}] Session finished", session),
        Err(e) if e.is_disconnect() => debug!("[{}] Client went away: {}", session, e),
        Err(e) => warn!("[{}] Session ended with error: {}", session, e),
    }

    stats::session_closed();
    info!("[{}] Client connection from {} closed", session, peer);
}

async fn serve(context: &SessionContext, session: Uuid, client: TcpStream) -> Result<()> {
    let config = &context.config;
    let (read, mut write) = client.into_split();
    let mut frames = FramedRead::new(
        read,
        FrameDecoder::startup().with_max_frame_len(config.max_frame_len),
    );

    let handshake = {
        let mut handshake =
            Handshake::new(session, &mut frames, &mut write, &config.default_parameters);
        let outcome = timeout(
            config.handshake_timeout,
            handshake.run(&context.router, &context.pools),
        )
        .await;
        outcome
    };

    let (origin, params) = match handshake {
        Ok(Ok(HandshakeOutcome::Ready { origin, params })) => (origin, params),
        Ok(Ok(HandshakeOutcome::Closed)) => {
            let _ = write.shutdown().await;
            return Ok(());
        }
        Ok(Err(e)) => {
            stats::handshake_failed();
            let _ = write.shutdown().await;
            return Err(e);
        }
        Err(_) => {
            stats::handshake_failed();
            let error = ProxyError::Timeout(format!(
                "handshake not completed within {:?}",
                config.handshake_timeout
            ));
            let (code, message) = to_pg_error(&error);
            let _ = write
                .write_all(&formatter::error_response("FATAL", &code, &message))
                .await;
            let _ = write.shutdown().await;
            return Err(error);
        }
    };

    let (connection, lease) = origin.into_parts();
    debug!(
        "[{}] Relaying {:?}/{:?} through pool '{}'",
        session,
        params.get("user"),
        params.get("database"),
        lease.pool_name()
    );

    let report = relay(session, frames, write, connection, context.relay_settings()).await;
    let RelayReport {
        verdict,
        origin,
        client_write,
        ..
    } = report;

    match origin {
        Some(connection) => settle(context, session, verdict, connection, lease).await,
        // The lease evicts on drop
        None => drop(lease),
    }

    if let Some(mut client_write) = client_write {
        let _ = client_write.shutdown().await;
    }
    Ok(())
}

async fn settle(
    context: &SessionContext,
    session: Uuid,
    verdict: ReleaseVerdict,
    mut connection: OriginConnection,
    lease: PoolLease,
) {
    if let ReleaseVerdict::Evict(reason) = verdict {
        debug!("[{}] Closing origin connection: {}", session, reason);
        lease.evict(connection);
        return;
    }

    if let Some(query) = context.config.reset_query.as_deref() {
        if let Err(e) = connection.reset(query, context.config.write_timeout).await {
            warn!("[{}] Origin reset failed, closing connection: {}", session, e);
            lease.evict(connection);
            return;
        }
    }

    debug!("[{}] Returning origin connection to '{}'", session, lease.pool_name());
    lease.release(connection);
}

//! Server implementation for the PostgreSQL proxy
//!
//! The server accepts client connections and runs each one as an independent
//! session task. Shutdown stops accepting, lets open sessions finish within a
//! grace period, aborts whatever is left and closes idle origin connections.

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::routing::{ProviderRegistry, Router};
use crate::session::{run_session, SessionContext};
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

/// Pause after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Main proxy server implementation
pub struct ProxyServer {
    /// Bound listener
    listener: TcpListener,

    /// State shared with sessions
    context: Arc<SessionContext>,
}

impl ProxyServer {
    /// Validate the configuration, build the router and bind the listener
    pub async fn bind(config: ProxyConfig, providers: ProviderRegistry) -> Result<Self> {
        config.validate()?;

        let router = Router::new(config.routes.clone(), providers, config.match_policy);
        if router.is_empty() {
            warn!("No routing rules configured; every client will be refused");
        }

        let listener = TcpListener::bind(config.listen_addr).await?;
        info!(
            "Proxy server listening on {} ({} routes, pool size {}, {} policy)",
            listener.local_addr()?,
            router.len(),
            config.pool.max_size,
            config.pool.policy
        );

        Ok(Self {
            listener,
            context: Arc::new(SessionContext::new(config, router)),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared session state, including the origin pools
    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.context)
    }

    /// Accept clients until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ProxyServer { listener, context } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting clients");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                            }
                            sessions.spawn(run_session(Arc::clone(&context), stream, peer));
                        }
                        Err(e) => {
                            // Errors such as EMFILE persist; let sessions free descriptors
                            error!("Error accepting connection: {}", e);
                            sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                // Reap finished sessions so the set does not grow unbounded
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        drain(sessions, context.config.shutdown_timeout).await;
        context.pools.close_idle().await;
        info!("Proxy server stopped");
        Ok(())
    }

    /// Accept clients until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

async fn drain(mut sessions: JoinSet<()>, grace: Duration) {
    if sessions.is_empty() {
        return;
    }

    info!("Waiting up to {:?} for {} open sessions", grace, sessions.len());
    let drained = timeout(grace, async {
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Session task failed: {}", e);
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!("Aborting {} sessions still open", sessions.len());
        sessions.shutdown().await;
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use metrics_exporter_prometheus::PrometheusBuilder;
use pgproxy::config::{load_routes, PoolPolicy, ProxyConfig};
use pgproxy::routing::{MatchPolicy, ProviderRegistry};
use pgproxy::server::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Pooling, routing PostgreSQL wire protocol proxy")]
struct Args {
    /// Routing rules file (JSON)
    #[clap(env = "PGPROXY_ROUTES")]
    routes: PathBuf,

    /// Address to accept clients on
    #[clap(long, env = "PGPROXY_LISTEN", default_value = "127.0.0.1:5433")]
    listen: SocketAddr,

    /// Log level (debug, info, warn, error)
    #[clap(long, env = "PGPROXY_LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,

    /// Maximum origin connections per routing target
    #[clap(long, env = "PGPROXY_POOL_SIZE", default_value_t = 10)]
    pool_size: usize,

    /// What to do when a pool is full (wait, fail-fast)
    #[clap(long, env = "PGPROXY_POOL_POLICY", default_value = "wait")]
    pool_policy: PoolPolicy,

    /// Seconds an acquisition may wait for a free connection
    #[clap(long, env = "PGPROXY_ACQUIRE_TIMEOUT", default_value_t = 30)]
    acquire_timeout: u64,

    /// Which rule wins when several match (first, last)
    #[clap(long, env = "PGPROXY_MATCH_POLICY", default_value = "first")]
    match_policy: MatchPolicy,

    /// Statement run before an origin connection is reused; empty disables
    #[clap(long, env = "PGPROXY_RESET_QUERY", default_value = "DISCARD ALL")]
    reset_query: String,

    /// Seconds without traffic before a session is closed; 0 disables
    #[clap(long, env = "PGPROXY_IDLE_TIMEOUT", default_value_t = 3600)]
    idle_timeout: u64,

    /// Serve Prometheus metrics on this address
    #[clap(long, env = "PGPROXY_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig> {
        let routes = load_routes(&self.routes)
            .with_context(|| format!("loading routes from {}", self.routes.display()))?;

        let mut config = ProxyConfig::new();
        config.listen_addr = self.listen;
        config.routes = routes;
        config.match_policy = self.match_policy;
        config.pool.max_size = self.pool_size;
        config.pool.policy = self.pool_policy;
        config.pool.acquire_timeout = Duration::from_secs(self.acquire_timeout);
        config.idle_timeout = match self.idle_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        config.reset_query = match self.reset_query.trim() {
            "" => None,
            query => Some(query.to_string()),
        };
        config.metrics_addr = self.metrics_addr;

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, args.log_level.to_string()),
    );

    let config = args.into_config()?;

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("starting Prometheus exporter")?;
        info!("Serving metrics on http://{}/metrics", addr);
    }

    let providers = ProviderRegistry::with_builtin(config.connect_timeout);
    let server = ProxyServer::bind(config, providers)
        .await
        .context("starting proxy server")?;

    info!("Starting PostgreSQL wire protocol proxy on {}", server.local_addr()?);
    server.run_until(shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C");
}

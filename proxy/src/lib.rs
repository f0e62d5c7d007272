//! Pooling PostgreSQL Proxy
//!
//! This crate provides a transparent PostgreSQL wire protocol proxy. Clients
//! are routed by their startup parameters to an origin database, served from
//! a per-origin connection pool, and then relayed frame by frame.

// Error types and result
pub mod error;
pub use error::{ProxyError, Result};

// Configuration
pub mod config;
pub use config::{PoolConfig, PoolPolicy, ProxyConfig};

// Protocol-related modules
pub mod protocol;
pub use protocol::{Frame, FrameDecoder, FrameKind};

// Routing and credential providers
pub mod routing;
pub use routing::{CredentialProvider, MatchPolicy, ProviderRegistry, Router, RoutingRule};

// Origin connections and pools
pub mod origin;
pub use origin::{OriginConnection, OriginPools};

// Client sessions
pub mod session;

// Server implementation
pub mod server;
pub use server::ProxyServer;

// Metrics
pub mod stats;

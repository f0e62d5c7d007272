//! Origin database connections
//!
//! This module provides the connector that logs in to origin servers and the
//! per-target pools that keep those connections for reuse.

/// Authenticated origin connections
pub mod connection;

/// Per-target connection pools
pub mod pool;

pub use self::connection::{OriginConnection, OriginInfo, OriginSettings};
pub use self::pool::{OriginPool, OriginPools, PoolLease, PoolStats, PooledOrigin};

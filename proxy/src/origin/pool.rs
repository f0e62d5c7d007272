//! Origin connection pools
//!
//! This module provides [`OriginPool`], a bounded set of reusable origin
//! connections for one routing target, and [`OriginPools`], which creates a
//! pool per target the first time the target is routed to.
//!
//! Every pool keeps `idle + checked_out <= capacity`. Slots are reserved under
//! the pool mutex before a new connection is opened, and the mutex is never
//! held across an `.await`. A checked-out connection carries a
//! [`PoolLease`]; dropping the lease without releasing it frees the slot as an
//! eviction.

use crate::config::{PoolConfig, PoolPolicy};
use crate::error::{ProxyError, Result};
use crate::origin::OriginConnection;
use crate::routing::OriginTarget;
use crate::stats;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Snapshot of a pool's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections ready to be handed out
    pub idle: usize,

    /// Connections currently held by sessions (including ones being opened)
    pub checked_out: usize,

    /// Maximum of `idle + checked_out`
    pub capacity: usize,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<OriginConnection>,
    checked_out: usize,
}

enum Checkout {
    Idle(OriginConnection),
    Reserved,
    Full,
}

/// Bounded pool of origin connections for one target
pub struct OriginPool {
    target: OriginTarget,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
}

impl OriginPool {
    /// Create an empty pool; connections are opened on demand
    pub fn new(target: OriginTarget, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            target,
            config,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
        })
    }

    /// Target name
    pub fn name(&self) -> &str {
        self.target.name()
    }

    /// Current bookkeeping
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            capacity: self.config.max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_checkout(&self) -> Checkout {
        let mut stale = 0;
        let checkout = {
            let mut state = self.lock();
            loop {
                match state.idle.pop() {
                    Some(conn) if conn.is_stale() => {
                        stale += 1;
                    }
                    Some(conn) => {
                        state.checked_out += 1;
                        break Checkout::Idle(conn);
                    }
                    None if state.checked_out < self.config.max_size => {
                        state.checked_out += 1;
                        break Checkout::Reserved;
                    }
                    None => break Checkout::Full,
                }
            }
        };

        for _ in 0..stale {
            debug!("Dropped stale idle connection from pool '{}'", self.name());
            stats::pool_evicted(self.name());
            self.available.notify_one();
        }
        checkout
    }

    /// Hand out an idle connection, or open a new one if there is room
    ///
    /// At capacity the call fails with [`ProxyError::PoolExhausted`] right
    /// away under [`PoolPolicy::FailFast`], or after waiting up to the
    /// acquire timeout under [`PoolPolicy::Wait`].
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledOrigin> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_checkout() {
                Checkout::Idle(connection) => {
                    debug!("Reusing idle connection from pool '{}'", self.name());
                    stats::pool_acquired(self.name());
                    return Ok(PooledOrigin {
                        connection,
                        lease: PoolLease::new(Arc::clone(self)),
                    });
                }
                Checkout::Reserved => {
                    // Dropping the lease gives the reserved slot back
                    let lease = PoolLease::new(Arc::clone(self));
                    return match self.target.connect().await {
                        Ok(connection) => {
                            debug!(
                                "Opened connection {} for pool '{}'",
                                connection.addr(),
                                self.name()
                            );
                            stats::pool_created(self.name());
                            stats::pool_acquired(self.name());
                            Ok(PooledOrigin { connection, lease })
                        }
                        Err(e) => {
                            lease.abandon();
                            Err(e)
                        }
                    };
                }
                Checkout::Full => {}
            }

            match self.config.policy {
                PoolPolicy::FailFast => return Err(self.exhausted()),
                PoolPolicy::Wait => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(self.exhausted());
                    }
                }
            }
        }
    }

    fn exhausted(&self) -> ProxyError {
        warn!("Pool '{}' is exhausted", self.name());
        stats::pool_exhausted(self.name());
        ProxyError::PoolExhausted(self.name().to_string())
    }

    fn put_idle(&self, connection: OriginConnection) {
        {
            let mut state = self.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            state.idle.push(connection);
        }
        self.available.notify_one();
    }

    fn free_slot(&self) {
        {
            let mut state = self.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn take_idle(&self) -> Vec<OriginConnection> {
        std::mem::take(&mut self.lock().idle)
    }
}

/// Claim on one pool slot
///
/// Consumed by [`PoolLease::release`]; any other way of getting rid of it
/// frees the slot and counts as an eviction.
pub struct PoolLease {
    pool: Arc<OriginPool>,
    settled: bool,
}

impl PoolLease {
    fn new(pool: Arc<OriginPool>) -> Self {
        Self {
            pool,
            settled: false,
        }
    }

    /// Name of the pool the slot belongs to
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Return a healthy connection to the idle set
    pub fn release(mut self, connection: OriginConnection) {
        self.settled = true;
        debug!("Released connection to pool '{}'", self.pool.name());
        self.pool.put_idle(connection);
    }

    /// Close a connection and free its slot
    pub fn evict(self, connection: OriginConnection) {
        drop(connection);
    }

    /// Free a slot whose connection was never opened
    fn abandon(mut self) {
        self.settled = true;
        self.pool.free_slot();
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Evicted connection from pool '{}'", self.pool.name());
            stats::pool_evicted(self.pool.name());
            self.pool.free_slot();
        }
    }
}

/// A checked-out origin connection
///
/// Dropping the handle closes the connection and frees its slot.
pub struct PooledOrigin {
    connection: OriginConnection,
    lease: PoolLease,
}

impl PooledOrigin {
    /// The connection
    pub fn connection(&self) -> &OriginConnection {
        &self.connection
    }

    /// Split into the connection and its slot
    pub fn into_parts(self) -> (OriginConnection, PoolLease) {
        (self.connection, self.lease)
    }

    /// Return the connection to the idle set
    pub fn release(self) {
        self.lease.release(self.connection);
    }

    /// Close the connection and free its slot
    pub fn evict(self) {
        self.lease.evict(self.connection);
    }
}

/// One pool per routing target, created on first use
pub struct OriginPools {
    config: PoolConfig,
    pools: Mutex<HashMap<String, Arc<OriginPool>>>,
}

impl OriginPools {
    /// Create an empty registry; `config` applies to every pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<OriginPool>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The pool for `target`, creating it if needed
    pub fn pool_for(&self, target: &OriginTarget) -> Arc<OriginPool> {
        let mut pools = self.lock();
        Arc::clone(pools.entry(target.name().to_string()).or_insert_with(|| {
            debug!("Creating pool for target '{}'", target.name());
            OriginPool::new(target.clone(), self.config.clone())
        }))
    }

    /// Acquire a connection for `target`
    pub async fn acquire(&self, target: &OriginTarget) -> Result<PooledOrigin> {
        self.pool_for(target).acquire().await
    }

    /// Bookkeeping of the pool for a target, if it exists
    pub fn stats(&self, name: &str) -> Option<PoolStats> {
        self.lock().get(name).map(|pool| pool.stats())
    }

    /// Politely close every idle connection
    pub async fn close_idle(&self) {
        let pools: Vec<Arc<OriginPool>> = self.lock().values().cloned().collect();
        for pool in pools {
            let idle = pool.take_idle();
            if !idle.is_empty() {
                debug!("Closing {} idle connections of pool '{}'", idle.len(), pool.name());
            }
            for connection in idle {
                connection.close().await;
            }
        }
    }
}

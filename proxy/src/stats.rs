//! Metric names and recording helpers
//!
//! All recording goes through the `metrics` facade, so nothing is collected
//! unless a recorder (the Prometheus exporter installed by the binary, for
//! instance) has been set up.

use metrics::{decrement_gauge, increment_counter, increment_gauge};

/// Client sessions accepted
pub const SESSIONS_TOTAL: &str = "pgproxy_sessions_total";

/// Client sessions currently open
pub const SESSIONS_ACTIVE: &str = "pgproxy_sessions_active";

/// Handshakes that ended in an error
pub const HANDSHAKE_FAILURES_TOTAL: &str = "pgproxy_handshake_failures_total";

/// Frames written through by the relay, labelled by direction
pub const FRAMES_RELAYED_TOTAL: &str = "pgproxy_frames_relayed_total";

/// Origin connections handed out by a pool
pub const POOL_ACQUIRED_TOTAL: &str = "pgproxy_pool_acquired_total";

/// Origin connections opened by a pool
pub const POOL_CREATED_TOTAL: &str = "pgproxy_pool_created_total";

/// Origin connections closed by a pool
pub const POOL_EVICTED_TOTAL: &str = "pgproxy_pool_evicted_total";

/// Acquisitions refused because a pool was at capacity
pub const POOL_EXHAUSTED_TOTAL: &str = "pgproxy_pool_exhausted_total";

/// Relay direction label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to origin
    ClientToOrigin,

    /// Origin to client
    OriginToClient,
}

impl Direction {
    /// Label value
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToOrigin => "client_to_origin",
            Direction::OriginToClient => "origin_to_client",
        }
    }
}

pub(crate) fn session_opened() {
    increment_counter!(SESSIONS_TOTAL);
    increment_gauge!(SESSIONS_ACTIVE, 1.0);
}

pub(crate) fn session_closed() {
    decrement_gauge!(SESSIONS_ACTIVE, 1.0);
}

pub(crate) fn handshake_failed() {
    increment_counter!(HANDSHAKE_FAILURES_TOTAL);
}

pub(crate) fn frame_relayed(direction: Direction) {
    increment_counter!(FRAMES_RELAYED_TOTAL, "direction" => direction.as_str());
}

pub(crate) fn pool_acquired(target: &str) {
    increment_counter!(POOL_ACQUIRED_TOTAL, "target" => target.to_string());
}

pub(crate) fn pool_created(target: &str) {
    increment_counter!(POOL_CREATED_TOTAL, "target" => target.to_string());
}

pub(crate) fn pool_evicted(target: &str) {
    increment_counter!(POOL_EVICTED_TOTAL, "target" => target.to_string());
}

pub(crate) fn pool_exhausted(target: &str) {
    increment_counter!(POOL_EXHAUSTED_TOTAL, "target" => target.to_string());
}

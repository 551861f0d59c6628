//! Dispatch counters shared by all region clients of one client instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of dispatch counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames written to a channel.
    pub rpcs_sent: u64,
    /// Requests sitting in a batch waiting for a flush.
    pub pending_batched_rpcs: u64,
    /// Requests waiting for a channel to be attached.
    pub pending_rpcs: u64,
    /// Multi-action frames sent.
    pub num_multi_rpcs: u64,
    /// Written requests awaiting their response.
    pub rpcs_inflight: u64,
    /// Requests handed back to the facade for rerouting.
    pub rpcs_rerouted: u64,
    /// Leaf requests failed because their connection died. A failed batch
    /// counts once per element.
    pub connection_resets: u64,
    /// Connections that transitioned to dead.
    pub dead_connections: u64,
}

/// Thread-safe dispatch counters.
///
/// Created once per client and passed to every region client as an
/// `Arc<ClientStats>`.
pub struct ClientStats {
    rpcs_sent: AtomicU64,
    pending_batched_rpcs: AtomicU64,
    pending_rpcs: AtomicU64,
    num_multi_rpcs: AtomicU64,
    rpcs_inflight: AtomicU64,
    rpcs_rerouted: AtomicU64,
    connection_resets: AtomicU64,
    dead_connections: AtomicU64,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn saturating_sub(gauge: &AtomicU64, n: u64) {
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(n))
    });
}

impl ClientStats {
    /// Creates counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rpcs_sent: AtomicU64::new(0),
            pending_batched_rpcs: AtomicU64::new(0),
            pending_rpcs: AtomicU64::new(0),
            num_multi_rpcs: AtomicU64::new(0),
            rpcs_inflight: AtomicU64::new(0),
            rpcs_rerouted: AtomicU64::new(0),
            connection_resets: AtomicU64::new(0),
            dead_connections: AtomicU64::new(0),
        }
    }

    /// Counts a frame written to a channel.
    pub fn inc_rpcs_sent(&self) {
        self.rpcs_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a multi-action frame written to a channel.
    pub fn inc_num_multi_rpcs(&self) {
        self.num_multi_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request added to a batch.
    pub fn inc_pending_batched(&self) {
        self.pending_batched_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes `n` requests from the pending-batched gauge, saturating at zero.
    pub fn dec_pending_batched(&self, n: u64) {
        saturating_sub(&self.pending_batched_rpcs, n);
    }

    /// Counts a request queued until connected.
    pub fn inc_pending_rpcs(&self) {
        self.pending_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes `n` requests from the pending-connect gauge, saturating at zero.
    pub fn dec_pending_rpcs(&self, n: u64) {
        saturating_sub(&self.pending_rpcs, n);
    }

    /// Counts a request awaiting its response.
    pub fn inc_inflight(&self) {
        self.rpcs_inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes `n` requests from the in-flight gauge, saturating at zero.
    pub fn dec_inflight(&self, n: u64) {
        saturating_sub(&self.rpcs_inflight, n);
    }

    /// Counts a request handed back for rerouting.
    pub fn inc_rerouted(&self) {
        self.rpcs_rerouted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request failed by a dead connection.
    pub fn inc_connection_resets(&self) {
        self.connection_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts `n` requests failed by a dead connection.
    pub fn add_connection_resets(&self, n: u64) {
        self.connection_resets.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts a connection that became dead.
    pub fn inc_dead_connections(&self) {
        self.dead_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rpcs_sent: self.rpcs_sent.load(Ordering::Relaxed),
            pending_batched_rpcs: self.pending_batched_rpcs.load(Ordering::Relaxed),
            pending_rpcs: self.pending_rpcs.load(Ordering::Relaxed),
            num_multi_rpcs: self.num_multi_rpcs.load(Ordering::Relaxed),
            rpcs_inflight: self.rpcs_inflight.load(Ordering::Relaxed),
            rpcs_rerouted: self.rpcs_rerouted.load(Ordering::Relaxed),
            connection_resets: self.connection_resets.load(Ordering::Relaxed),
            dead_connections: self.dead_connections.load(Ordering::Relaxed),
        }
    }
}

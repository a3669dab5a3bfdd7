//! A remote host, reachable over zero or more activated endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::rdma::gid::Gid;

/// A remote peer, as seen after the `HostInfo` exchange.
///
/// The endpoints activated toward a peer are owned by whichever
/// [`super::engine::IoEngine`] created them, not by `Host` — an engine never
/// touches another engine's endpoints, so the actual round-robin selection
/// used to dispatch a call lives on [`super::engine::IoEngine`]'s private
/// routing table, scoped to that engine's own endpoints toward a
/// destination. `Host` only tallies how many endpoints were activated
/// in total, across every engine, for bookkeeping (`host_count`-style
/// queries) and the advisory credit counter below.
pub struct Host {
    /// Remote GID, learned from the `HostInfo` record.
    pub gid: Gid,

    /// Endpoints activated toward this host, across all engines.
    endpoint_count: usize,

    /// Advisory admission-control counter. Not consulted on the hot path;
    /// reserved for application-level back-pressure policies.
    credit: AtomicUsize,

    /// Set once the GoGo exchange completes for this host.
    pub initialized: bool,
}

impl Host {
    pub fn new(gid: Gid) -> Self {
        Self {
            gid,
            endpoint_count: 0,
            credit: AtomicUsize::new(0),
            initialized: false,
        }
    }

    /// Record that one more endpoint was activated toward this host.
    pub fn add_endpoint(&mut self) {
        self.endpoint_count += 1;
    }

    /// Number of endpoints activated toward this host.
    pub fn endpoint_count(&self) -> usize {
        self.endpoint_count
    }

    /// Adjust the advisory credit counter.
    pub fn adjust_credit(&self, delta: isize) {
        if delta >= 0 {
            self.credit.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            self.credit.fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
    }

    /// Current value of the advisory credit counter.
    pub fn credit(&self) -> usize {
        self.credit.load(Ordering::Relaxed)
    }
}

//! Server counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters shared by the acceptor, handlers and broadcaster
#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    messages_relayed: AtomicU64,
    deliveries: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`] plus registry occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub active: usize,
    pub max_connections: usize,
    pub messages_relayed: u64,
    pub deliveries: u64,
    pub write_failures: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// One line fanned out to `delivered` peers, `failed` of which errored
    pub fn record_broadcast(&self, delivered: usize, failed: usize) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.write_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active: usize, max_connections: usize) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active,
            max_connections,
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

//! Broadcaster
//!
//! Fans one formatted line out to every registered peer except its sender.
//! Delivery is best effort: at most once per peer, no retry, and a failing
//! peer never affects the sender or the other peers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::connection::Registry;
use crate::stats::RelayStats;

/// Per-peer outcome of a single broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    stats: Arc<RelayStats>,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, stats: Arc<RelayStats>, write_timeout: Duration) -> Self {
        Self {
            registry,
            stats,
            write_timeout,
        }
    }

    /// Deliver `message` to everyone but `sender`.
    pub async fn broadcast(&self, sender: &str, message: Bytes) -> DeliveryReport {
        let deadline = self.write_timeout;
        let report = self
            .registry
            .for_each_except(sender, |peer| {
                let message = message.clone();
                async move { peer.send(&message, deadline).await }
            })
            .await;

        debug!(
            "Broadcast from {} reached {}/{} peers",
            sender,
            report.delivered.len(),
            report.attempted()
        );
        self.stats
            .record_broadcast(report.delivered.len(), report.failed.len());
        report
    }
}

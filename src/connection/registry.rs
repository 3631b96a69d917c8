//! Connection Registry
//!
//! Maps a connection's remote address to the write side of its stream. The
//! read side stays with the connection's handler task; the registry only ever
//! hands out shared references used to deliver broadcasts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::RelayError;
use crate::relay::DeliveryReport;
use crate::Result;

/// Type-erased write half of a client stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write handle for one registered connection.
///
/// A failed write may leave part of a message on the stream, so the first
/// failure evicts the peer: it is never written to again and its handler is
/// woken to tear the connection down.
pub struct Peer {
    id: String,
    writer: Mutex<BoxedWriter>,
    evicted: AtomicBool,
    eviction: Notify,
}

impl Peer {
    pub fn new<W>(id: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id: id.into(),
            writer: Mutex::new(Box::new(writer)),
            evicted: AtomicBool::new(false),
            eviction: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Write `data` in full, giving up after `deadline`. Any failure evicts
    /// the peer.
    pub async fn send(&self, data: &[u8], deadline: Duration) -> Result<()> {
        if self.is_evicted() {
            return Err(RelayError::Evicted(self.id.clone()).into());
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };

        let result: Result<()> = match timeout(deadline, write).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(RelayError::WriteTimeout {
                peer: self.id.clone(),
                timeout: deadline,
            }
            .into()),
        };

        if result.is_err() {
            self.evict();
        }
        result
    }

    /// Stop all further writes and wake whoever waits in [`Peer::evicted`].
    pub fn evict(&self) {
        if !self.evicted.swap(true, Ordering::SeqCst) {
            debug!("Evicting {}", self.id);
            // stores a permit if the handler is not waiting yet
            self.eviction.notify_one();
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Resolve once the peer has been evicted. Cancel safe.
    pub async fn evicted(&self) {
        if self.is_evicted() {
            return;
        }
        self.eviction.notified().await;
    }

    /// Shut down the write direction. Errors are ignored; the peer may
    /// already be gone.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} reported: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish()
    }
}

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The registry already held `active` connections
    Rejected { active: usize },
}

/// Shared registry of live connections.
///
/// Inserts and removals take the exclusive lock; counting and iteration take
/// the shared lock. Iteration holds the shared lock for its whole duration, so
/// a connection that is being torn down is either fully visible or absent.
#[derive(Default)]
pub struct Registry {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` unconditionally.
    pub async fn insert(&self, peer: Arc<Peer>) -> std::result::Result<(), RelayError> {
        let mut peers = self.peers.write().await;
        Self::insert_locked(&mut peers, peer)
    }

    /// Register `peer` if fewer than `max` connections are live. The check and
    /// the insert happen under one exclusive lock, so the count never
    /// overshoots `max`.
    pub async fn try_admit(
        &self,
        peer: Arc<Peer>,
        max: usize,
    ) -> std::result::Result<Admission, RelayError> {
        let mut peers = self.peers.write().await;
        let active = peers.len();
        if active >= max {
            debug!("Refusing {}: {} of {} slots in use", peer.id(), active, max);
            return Ok(Admission::Rejected { active });
        }

        Self::insert_locked(&mut peers, peer)?;
        Ok(Admission::Admitted)
    }

    fn insert_locked(
        peers: &mut HashMap<String, Arc<Peer>>,
        peer: Arc<Peer>,
    ) -> std::result::Result<(), RelayError> {
        if peers.contains_key(peer.id()) {
            error!("Registry invariant violated: {} is already registered", peer.id());
            return Err(RelayError::DuplicateKey(peer.id().to_string()));
        }
        peers.insert(peer.id().to_string(), peer);
        Ok(())
    }

    /// Remove `id`. Removing an absent id is a no-op.
    pub async fn remove(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Ids of all registered connections, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run `f` against every registered peer except `id`.
    ///
    /// Evicted peers are skipped. A failing `f` is logged and recorded;
    /// iteration carries on with the remaining peers.
    pub async fn for_each_except<F, Fut>(&self, id: &str, mut f: F) -> DeliveryReport
    where
        F: FnMut(Arc<Peer>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let peers = self.peers.read().await;
        let mut report = DeliveryReport::default();

        for (peer_id, peer) in peers.iter() {
            if peer_id == id || peer.is_evicted() {
                continue;
            }

            match f(Arc::clone(peer)).await {
                Ok(()) => report.delivered.push(peer_id.clone()),
                Err(e) => {
                    warn!("Delivery to {} failed: {}", peer_id, e);
                    report.failed.push(peer_id.clone());
                }
            }
        }

        report
    }
}

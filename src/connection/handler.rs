//! Connection Handler
//!
//! One task per admitted connection: read lines, broadcast them, and
//! deregister and close the connection exactly once when the loop ends.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, info, instrument, warn};

use super::registry::{Peer, Registry};
use crate::relay::{format_message, Broadcaster, LineReader};
use crate::shutdown::ShutdownSignal;

/// Settings and shared state every handler needs
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<Registry>,
    pub broadcaster: Broadcaster,
    pub max_line_length: usize,
    pub append_newline: bool,
}

/// Why a handler loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerExit {
    /// The client closed its side of the stream
    Disconnected,
    ReadFailed(String),
    /// A write to the client failed and the peer was evicted
    Evicted,
    Cancelled,
}

/// A live registry entry owned by its handler.
///
/// `release` removes the entry and closes the write side. If the handler
/// never gets there (panic, aborted task) the entry is removed on drop.
pub struct Registration {
    registry: Arc<Registry>,
    peer: Arc<Peer>,
    released: bool,
}

impl Registration {
    /// Wrap a peer that has already been inserted into `registry`.
    pub fn new(registry: Arc<Registry>, peer: Arc<Peer>) -> Self {
        Self {
            registry,
            peer,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        self.peer.id()
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub async fn release(mut self) {
        self.released = true;
        self.registry.remove(self.peer.id()).await;
        self.peer.close().await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let id = self.peer.id().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.remove(&id).await;
                });
            }
            Err(_) => warn!("No runtime to deregister {}; entry leaked", id),
        }
    }
}

/// Drive one connection until EOF, a read error, eviction or cancellation.
#[instrument(skip_all, fields(peer = %registration.id()))]
pub async fn handle_connection<R>(
    reader: R,
    registration: Registration,
    ctx: HandlerContext,
    mut shutdown: ShutdownSignal,
) -> HandlerExit
where
    R: AsyncRead + Unpin,
{
    let id = registration.id().to_string();
    let peer = Arc::clone(registration.peer());
    let mut lines = LineReader::new(reader, ctx.max_line_length);
    info!("Started handling connection from {}", id);

    let exit = loop {
        if shutdown.is_triggered() {
            break HandlerExit::Cancelled;
        }

        // the pending read loses no data if another branch wins the race
        let next = tokio::select! {
            _ = shutdown.recv() => break HandlerExit::Cancelled,
            _ = peer.evicted() => break HandlerExit::Evicted,
            result = lines.next_line() => result,
        };

        let payload = match next {
            Ok(Some(payload)) => payload,
            Ok(None) => break HandlerExit::Disconnected,
            Err(e) => break HandlerExit::ReadFailed(e.to_string()),
        };

        info!("[{}] {}", id, String::from_utf8_lossy(&payload));
        let message = format_message(&id, &payload, ctx.append_newline);
        ctx.broadcaster.broadcast(&id, message).await;
    };

    match &exit {
        HandlerExit::Disconnected => debug!("{} disconnected", id),
        HandlerExit::ReadFailed(e) => warn!("Error reading from {}: {}", id, e),
        HandlerExit::Evicted => warn!("Dropping {} after a failed write", id),
        HandlerExit::Cancelled => debug!("{} closing for shutdown", id),
    }

    registration.release().await;
    info!("Connection from {} closed", id);
    exit
}

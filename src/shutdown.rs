//! Graceful Shutdown Handling
//!
//! Turns SIGINT/SIGTERM (or a programmatic trigger) into a cancellation signal
//! shared by the acceptor loop and every connection handler, then waits for
//! the registry to drain.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connection::Registry;
use crate::Result;

/// Resolves on SIGTERM or SIGINT (Ctrl+C elsewhere).
///
/// Handlers are installed before returning so registration failures surface
/// before the server starts serving.
pub fn termination_signal() -> Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        let mut sigterm = unix_signal(SignalKind::terminate())?;
        let mut sigint = unix_signal(SignalKind::interrupt())?;

        Ok(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        })
    }

    #[cfg(not(unix))]
    {
        Ok(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
        })
    }
}

/// Shutdown coordinator that manages the graceful shutdown process
pub struct ShutdownCoordinator {
    handle: ShutdownHandle,
    /// How long to wait for connections to close after cancellation
    timeout: Duration,
}

/// Cloneable trigger for the shared cancellation signal
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

/// Receiving end held by each long-running task
pub struct ShutdownSignal {
    shutdown_rx: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            handle: ShutdownHandle {
                shutdown_tx,
                triggered: Arc::new(AtomicBool::new(false)),
            },
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> ShutdownSignal {
        self.handle.subscribe()
    }

    pub fn handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    pub fn trigger(&self) {
        self.handle.trigger();
    }

    pub fn is_triggered(&self) -> bool {
        self.handle.is_triggered()
    }

    /// Wait for `until` to complete, then trigger shutdown.
    pub async fn trigger_on<F>(&self, until: F)
    where
        F: Future<Output = ()>,
    {
        until.await;
        info!("Shutdown requested");
        self.trigger();
    }

    /// Wait until the registry is empty or the shutdown timeout elapses.
    /// Returns the number of connections still registered.
    pub async fn wait_for_drain(&self, registry: &Registry) -> usize {
        let start_time = Instant::now();
        let mut last_count = registry.len().await;
        info!(
            "Waiting for {} active connections to close (timeout: {:?})",
            last_count, self.timeout
        );

        while last_count > 0 && start_time.elapsed() < self.timeout {
            tokio::time::sleep(Duration::from_millis(20)).await;

            let current_count = registry.len().await;
            if current_count != last_count {
                debug!("Active connections: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        let elapsed = start_time.elapsed();
        if last_count == 0 {
            info!("All connections closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                elapsed, last_count
            );
        }

        last_count
    }
}

impl ShutdownHandle {
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            shutdown_rx: self.shutdown_tx.subscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }

    /// Request shutdown. Repeated calls are harmless.
    pub fn trigger(&self) {
        // flag first, so subscribers created after the send still see it
        if !self.triggered.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.shutdown_tx.send(()) {
                debug!("Shutdown signal had no listeners: {}", e);
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested. Cancel safe.
    pub async fn recv(&mut self) {
        if self.is_triggered() {
            return;
        }
        // a lagged or closed channel means the sender fired or went away
        let _ = self.shutdown_rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut first = coordinator.subscribe();
        let mut second = coordinator.subscribe();

        coordinator.trigger();

        timeout(Duration::from_secs(1), first.recv()).await.unwrap();
        timeout(Duration::from_secs(1), second.recv()).await.unwrap();
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.trigger();

        let mut late = coordinator.subscribe();
        assert!(late.is_triggered());
        timeout(Duration::from_secs(1), late.recv()).await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let handle = coordinator.handle();
        handle.trigger();
        handle.trigger();
        coordinator.trigger();
        assert!(handle.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_pends_until_triggered() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut signal = coordinator.subscribe();

        assert!(timeout(Duration::from_millis(50), signal.recv()).await.is_err());

        let handle = coordinator.handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            handle.trigger();
        });

        timeout(Duration::from_secs(1), signal.recv()).await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_on_future() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.trigger_on(sleep(Duration::from_millis(10))).await;
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_for_drain_empty_registry() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let registry = Registry::new();
        assert_eq!(coordinator.wait_for_drain(&registry).await, 0);
    }

    #[tokio::test]
    async fn test_wait_for_drain_times_out() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let registry = Registry::new();
        let (tx, _rx) = tokio::io::duplex(16);
        registry
            .insert(crate::connection::Peer::new("stuck", tx))
            .await
            .unwrap();

        assert_eq!(coordinator.wait_for_drain(&registry).await, 1);
    }
}

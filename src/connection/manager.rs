//! Relay server: listener ownership, admission control and the accept loop

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::handler::{handle_connection, HandlerContext, Registration};
use super::registry::{Admission, Peer, Registry};
use crate::config::Config;
use crate::error::RelayError;
use crate::relay::Broadcaster;
use crate::shutdown::{self, ShutdownCoordinator, ShutdownHandle, ShutdownSignal};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::Result;

/// A bound relay server. Created by [`RelayServer::start`], driven by
/// [`RelayServer::run`].
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<Config>,
    registry: Arc<Registry>,
    stats: Arc<RelayStats>,
    shutdown: ShutdownCoordinator,
}

impl RelayServer {
    /// Bind `bind_addr` with room for `max_users` concurrent clients and
    /// defaults for everything else.
    pub async fn start(bind_addr: SocketAddr, max_users: usize) -> Result<Self> {
        let mut config = Config::default();
        config.server.bind_addr = bind_addr;
        config.server.max_connections = max_users;
        config.validate()?;
        Self::with_config(Arc::new(config)).await
    }

    /// Bind the listener described by `config`.
    pub async fn with_config(config: Arc<Config>) -> Result<Self> {
        let bind_addr = config.server.bind_addr;
        info!("Binding TCP listener to {}", bind_addr);

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("Successfully bound to {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            shutdown: ShutdownCoordinator::new(config.server.shutdown_timeout),
            config,
            registry: Arc::new(Registry::new()),
            stats: Arc::new(RelayStats::new()),
        })
    }

    /// The address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Trigger for stopping the server from elsewhere
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    /// Counters plus current occupancy
    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            max_connections: self.config.server.max_connections,
        }
    }

    /// Serve until SIGINT/SIGTERM (or a trigger through
    /// [`RelayServer::shutdown_handle`]), then drain.
    pub async fn run(self) -> Result<()> {
        let signal = shutdown::termination_signal()?;
        self.run_until(signal).await
    }

    /// Serve until `until` completes or shutdown is triggered, then stop
    /// accepting, cancel every handler and wait up to `shutdown_timeout` for
    /// the registry to drain.
    pub async fn run_until<F>(self, until: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let RelayServer {
            listener,
            local_addr,
            config,
            registry,
            stats,
            shutdown,
        } = self;

        let handle = shutdown.handle();
        let acceptor = Acceptor {
            listener,
            ctx: HandlerContext {
                registry: Arc::clone(&registry),
                broadcaster: Broadcaster::new(
                    Arc::clone(&registry),
                    Arc::clone(&stats),
                    config.server.write_timeout,
                ),
                max_line_length: config.server.max_line_length,
                append_newline: config.server.append_newline,
            },
            config: Arc::clone(&config),
            stats,
            shutdown: handle.clone(),
        };

        info!(
            "Relay listening on {} (max connections: {})",
            local_addr, config.server.max_connections
        );
        let mut accept_task = tokio::spawn(acceptor.run(handle.subscribe()));

        let mut until_signal = handle.subscribe();
        let finished = tokio::select! {
            _ = shutdown.trigger_on(until) => None,
            _ = until_signal.recv() => None,
            joined = &mut accept_task => Some(joined),
        };

        shutdown.trigger();
        let joined = match finished {
            Some(joined) => {
                warn!("Acceptor stopped before shutdown was requested");
                joined
            }
            None => accept_task.await,
        };
        if let Err(e) = joined {
            error!("Acceptor task failed: {}", e);
        }

        let remaining = shutdown.wait_for_drain(&registry).await;
        if remaining > 0 {
            warn!("{} connections were still open at exit", remaining);
        }
        info!("Relay on {} stopped", local_addr);
        Ok(())
    }
}

/// Read-only view of server counters, usable while the server runs
#[derive(Clone)]
pub struct StatsHandle {
    registry: Arc<Registry>,
    stats: Arc<RelayStats>,
    max_connections: usize,
}

impl StatsHandle {
    pub async fn snapshot(&self) -> StatsSnapshot {
        let active = self.registry.len().await;
        self.stats.snapshot(active, self.max_connections)
    }
}

/// Owns the listener for the lifetime of the accept loop
struct Acceptor {
    listener: TcpListener,
    ctx: HandlerContext,
    config: Arc<Config>,
    stats: Arc<RelayStats>,
    shutdown: ShutdownHandle,
}

impl Acceptor {
    async fn run(self, mut signal: ShutdownSignal) {
        info!("Starting connection acceptance loop");

        loop {
            if signal.is_triggered() {
                break;
            }

            let accepted = tokio::select! {
                _ = signal.recv() => None,
                result = self.listener.accept() => Some(result),
            };

            match accepted {
                None => break,
                Some(Ok((stream, addr))) => self.admit(stream, addr).await,
                Some(Err(e)) => {
                    error!("Error accepting connection: {}", e);
                    tokio::select! {
                        _ = signal.recv() => break,
                        _ = tokio::time::sleep(self.config.server.accept_backoff) => {}
                    }
                }
            }
        }

        // dropping self closes the listener
        info!("Connection acceptance loop stopped");
    }

    async fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let id = addr.to_string();
        debug!("Accepted connection from {}", id);

        let (reader, writer) = stream.into_split();
        let peer = Peer::new(id.clone(), writer);
        let max = self.config.server.max_connections;

        match self.ctx.registry.try_admit(Arc::clone(&peer), max).await {
            Ok(Admission::Admitted) => {
                self.stats.record_accepted();
                let registration = Registration::new(Arc::clone(&self.ctx.registry), peer);
                tokio::spawn(handle_connection(
                    reader,
                    registration,
                    self.ctx.clone(),
                    self.shutdown.subscribe(),
                ));
            }
            Ok(Admission::Rejected { active }) => {
                self.stats.record_rejected();
                info!(
                    "Connection limit reached ({}/{}), rejecting {}",
                    active, max, id
                );
                let mut notice = self.config.server.rejection_message.clone().into_bytes();
                notice.push(b'\n');
                let deadline = self.config.server.write_timeout;
                // a slow client must not stall the accept loop
                tokio::spawn(async move {
                    if let Err(e) = peer.send(&notice, deadline).await {
                        debug!("Could not deliver rejection to {}: {}", peer.id(), e);
                    }
                    peer.close().await;
                    drop(reader);
                });
            }
            Err(e) => {
                error!("Refusing {}: {}", id, e);
                peer.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bind_error_is_typed() {
        let first = RelayServer::start("127.0.0.1:0".parse().unwrap(), 2)
            .await
            .unwrap();
        let taken = first.local_addr();

        let err = match RelayServer::start(taken, 2).await {
            Ok(_) => panic!("second bind on {} unexpectedly succeeded", taken),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::Bind { addr, .. }) if *addr == taken
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_zero_capacity() {
        assert!(RelayServer::start("127.0.0.1:0".parse().unwrap(), 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_run_until_returns_when_future_completes() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap(), 2)
            .await
            .unwrap();
        let handle = server.shutdown_handle();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            server.run_until(tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert!(handle.is_triggered());
    }

    #[tokio::test]
    async fn test_rejected_client_gets_notice() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap(), 1)
            .await
            .unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let stats = server.stats_handle();
        let task = tokio::spawn(server.run_until(std::future::pending()));

        let _first = TcpStream::connect(addr).await.unwrap();
        // wait until the first client is registered
        tokio::time::timeout(Duration::from_secs(2), async {
            while stats.snapshot().await.active < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut notice = String::new();
        tokio::time::timeout(Duration::from_secs(2), second.read_to_string(&mut notice))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice,
            "This server does not allow connections currently\n"
        );

        let snap = stats.snapshot().await;
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.active, 1);

        handle.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

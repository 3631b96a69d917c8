//! Relay error types
//!
//! Most plumbing returns `anyhow::Result`; the variants here are the failures
//! callers have to tell apart.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener could not be created. Fatal at startup.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A connection id was registered twice. Should be unreachable since the
    /// OS hands out unique ephemeral ports.
    #[error("connection {0} is already registered")]
    DuplicateKey(String),

    #[error("line exceeds the maximum length of {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("write to {peer} timed out after {timeout:?}")]
    WriteTimeout { peer: String, timeout: Duration },

    /// An earlier write failed; the peer is awaiting teardown.
    #[error("connection {0} was evicted after a failed write")]
    Evicted(String),
}

//! LineRelay Library
//!
//! A line-oriented TCP broadcast relay. Clients send newline-terminated lines;
//! each line is fanned out to every other connected client as
//! `<sender address> -> <line>`.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod relay;
pub mod shutdown;
pub mod stats;

pub use config::Config;
pub use connection::{Registry, RelayServer};
pub use error::RelayError;
pub use shutdown::{ShutdownCoordinator, ShutdownHandle};

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;

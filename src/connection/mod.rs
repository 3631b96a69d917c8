//! Connection Management Module

pub mod handler;
pub mod manager;
pub mod registry;

pub use handler::{handle_connection, HandlerContext, HandlerExit, Registration};
pub use manager::{RelayServer, StatsHandle};
pub use registry::{Admission, Peer, Registry};

//! Relay Module
//!
//! Line framing and fan-out of relayed messages.

pub mod broadcaster;
pub mod frame;

pub use broadcaster::{Broadcaster, DeliveryReport};
pub use frame::{format_message, LineReader};

//! Radio nodes reached through WebSocket bridges.

mod bridge;
mod hub;
pub mod packet;

pub use bridge::{BackoffConfig, RadioBridge};
pub use hub::{INBOUND_BUFFER, RadioHub};

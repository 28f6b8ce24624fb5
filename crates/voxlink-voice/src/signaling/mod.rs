//! Signaling transport: one shared WebSocket per authenticated session.
//!
//! Handles the hello/ready handshake, keep-alive pings, multicast delivery
//! of inbound messages and reconnect with capped exponential backoff.

mod backoff;
mod client;
mod connection;
mod subscribers;
mod types;

pub use backoff::Backoff;
pub use client::SignalingClient;
pub use subscribers::Subscription;
pub use types::SignalingStatus;

#[cfg(any(test, feature = "test-util"))]
pub use client::SignalingRemote;

//! WebSocket primitives shared by the broadcast hub and its subscribers.
//!
//! This module provides only identity and configuration. The actual
//! connection lifecycle (§4.4 Subscriber), fan-out (§4.5 BroadcastHub), and
//! bounded per-subscriber queue (§4.3 RingBuffer) live in [`crate::core`].

mod config;
mod handler;

pub use config::WebSocketConfig;
pub use handler::ConnectionId;

// Re-export axum WebSocket types for convenience at the handler boundary.
pub use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};

//! WebSocket configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WebSocket server configuration (§6: maxMessageBytes, ping/pong cadence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes (default: 64 KiB, §6).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Ping interval in seconds (keepalive probe cadence).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Pong timeout in seconds; missing a pong within this window closes
    /// the connection.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Per-subscriber send-queue capacity. Must be a power of two (§4.3).
    #[serde(default = "default_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Fraction of queue utilization above which backpressure policy applies.
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: f64,
}

impl WebSocketConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            send_queue_capacity: default_queue_capacity(),
            drop_threshold: default_drop_threshold(),
        }
    }
}

const fn default_max_message_bytes() -> usize {
    65536 // 64 KiB
}

const fn default_ping_interval() -> u64 {
    30
}

const fn default_pong_timeout() -> u64 {
    10
}

const fn default_queue_capacity() -> usize {
    256
}

const fn default_drop_threshold() -> f64 {
    0.8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_websocket_config() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_bytes, 65536);
        assert_eq!(config.ping_interval_secs, 30);
        assert_eq!(config.send_queue_capacity, 256);
    }

    #[test]
    fn test_duration_helpers() {
        let config = WebSocketConfig::default();
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.pong_timeout(), Duration::from_secs(10));
    }
}

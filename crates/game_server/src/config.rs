//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default values
//! used to initialize and customize the stream endpoint.

use crate::connection::multiplexer::DEFAULT_PUSH_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration structure for the game server.
///
/// Contains the network settings, connection limits and per-session queue
/// sizing used by every stream multiplexer the server spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections allowed
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Whether to use SO_REUSEPORT for multi-threaded accept loops
    #[serde(default)]
    pub use_reuse_port: bool,

    /// Capacity of each session's push queue
    #[serde(default = "default_push_queue_capacity")]
    pub push_queue_capacity: usize,

    /// Seconds a client gets to complete the WebSocket handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_push_queue_capacity() -> usize {
    DEFAULT_PUSH_QUEUE_CAPACITY
}

fn default_handshake_timeout() -> u64 {
    10
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            use_reuse_port: false,
            push_queue_capacity: default_push_queue_capacity(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 10000);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.push_queue_capacity, 16);
        assert!(!config.use_reuse_port);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "bind_address": "0.0.0.0:9000" }"#).unwrap();
        assert_eq!(config.bind_address.port(), 9000);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.push_queue_capacity, 16);
    }
}

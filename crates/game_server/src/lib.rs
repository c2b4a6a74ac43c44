//! # Game Server - Player Stream Endpoint
//!
//! The player-facing half of a game node. Every player holds one long-lived
//! bidirectional stream; this crate multiplexes that stream between
//! request/response traffic and asynchronous pushes from game logic.
//!
//! ## Message Flow
//!
//! 1. Client sends a `Register` frame carrying its user id
//! 2. The session's push queue is published in the [`SessionRegistry`]
//! 3. `Message` payloads are dispatched by their leading big-endian opcode
//!    to a handler from the [`HandlerTable`], under the global [`Latch`]
//! 4. A handler's return value goes back to the client as a `Message`
//! 5. Other tasks push frames through the registry at any time
//!
//! Handlers can end a session by calling [`Session::kick`]; the client then
//! receives a `Kick` frame and the stream closes.
//!
//! ## Example
//!
//! ```no_run
//! use bytes::BufMut;
//! use game_server::{create_server, HandlerTable};
//!
//! # async fn run() -> Result<(), game_server::ServerError> {
//! let handlers = HandlerTable::new().bind(1001, |_session, payload| {
//!     let id = payload.read_i32().ok()?;
//!     let mut reply = Vec::with_capacity(6);
//!     reply.put_u16(1002);
//!     reply.put_i32(id);
//!     Some(reply)
//! });
//! create_server(handlers).start().await
//! # }
//! ```
//!
//! ## Error Handling
//!
//! * [`SessionError`] ends a single stream and is logged by its connection task
//! * [`ServerError`] covers binding and accept failures
//! * [`PushError`] is returned to callers pushing to a player

// Re-export core types and functions for easy access
pub use config::ServerConfig;
pub use connection::{frame_channel, ClientStream, ConnectionId, StreamMultiplexer};
pub use error::{PushError, ServerError, SessionError};
pub use messaging::{Frame, FrameType, Handler, HandlerTable, Opcode, PayloadReader};
pub use server::GameServer;
pub use session::{Latch, PushSink, Session, SessionFlags, SessionRegistry, UserId};
pub use utils::{create_server, create_server_with_config};

// Public module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod server;
pub mod session;
pub mod utils;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_creation() {
        let handlers = HandlerTable::new().bind(1, |_, _| None);
        let server = create_server(handlers);
        assert_eq!(server.online_count(), 0);
        assert_eq!(server.active_connections(), 0);
        assert_eq!(server.config().max_connections, 1000);
    }

    #[test]
    fn test_server_configuration() {
        let config = ServerConfig {
            bind_address: "127.0.0.1:9999".parse().unwrap(),
            max_connections: 500,
            use_reuse_port: true,
            push_queue_capacity: 4,
            handshake_timeout_secs: 5,
        };
        let server = create_server_with_config(config, HandlerTable::new());
        assert_eq!(server.config().bind_address.port(), 9999);
        assert!(server.config().use_reuse_port);
    }
}

//! Connection management for client streams.
//!
//! The multiplexer is transport agnostic: it pulls frames from a
//! [`FrameReceiver`] and writes frames to a [`FrameSender`]. The WebSocket
//! transport used by the server and an in-memory channel transport both
//! implement these traits.

pub mod client;
pub mod memory;
pub mod multiplexer;
pub mod websocket;

pub use client::ClientConnection;
pub use memory::{frame_channel, ChannelReceiver, ChannelSender, ClientStream};
pub use multiplexer::StreamMultiplexer;

use crate::error::SessionError;
use crate::messaging::Frame;
use async_trait::async_trait;

/// Type alias for connection identifiers.
///
/// Connection IDs tag log output for one client stream from accept to close.
pub type ConnectionId = uuid::Uuid;

/// Inbound half of a player stream.
#[async_trait]
pub trait FrameReceiver: Send + 'static {
    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` when the client closed the stream cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, SessionError>;
}

/// Outbound half of a player stream.
#[async_trait]
pub trait FrameSender: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError>;
}

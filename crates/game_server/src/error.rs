//! Error types for the game server.
//!
//! [`SessionError`] covers everything that can end a single player stream,
//! [`ServerError`] covers listener and startup failures, and [`PushError`]
//! is what callers see when pushing an asynchronous frame to a player.

use crate::messaging::{FrameType, Opcode};
use crate::session::UserId;

/// Terminal conditions of a player stream.
///
/// Every variant is fatal to the stream that produced it. The multiplexer
/// performs its own cleanup (registry removal, pump shutdown) before the
/// error is returned to the connection task.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A `Message` frame arrived before any `Register` frame.
    #[error("session not registered")]
    NotRegistered,

    /// A `Register` frame tried to rebind an already registered session.
    #[error("session already registered as {current}, refusing to rebind to {requested}")]
    AlreadyRegistered { current: UserId, requested: UserId },

    /// No handler is bound for the opcode carried by a `Message` frame.
    #[error("service not bind: {0}")]
    HandlerNotBound(Opcode),

    /// The frame type is not valid in this direction.
    #[error("incorrect frame type: {0:?}")]
    IncorrectFrameType(FrameType),

    /// The message payload could not be read (e.g. shorter than an opcode).
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A protocol handler panicked while holding the latch.
    #[error("handler for opcode {0} panicked")]
    HandlerPanicked(Opcode),

    /// Sending or receiving on the underlying stream failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Errors raised by the server shell around the multiplexers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure to deliver an asynchronous frame to a player.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// No live session is registered for the player.
    #[error("player {0} not found or not connected")]
    NotFound(UserId),
    /// The player's push queue is at capacity.
    #[error("push queue full")]
    Full,
    /// The owning session has already terminated.
    #[error("push queue closed")]
    Closed,
}

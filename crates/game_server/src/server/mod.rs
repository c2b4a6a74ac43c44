//! Server shell around the stream multiplexers.
//!
//! [`GameServer`] owns the shared registry, handler table and latch, binds
//! the listeners and hands every accepted WebSocket to a multiplexer.

pub mod core;
pub mod handlers;

pub use core::GameServer;

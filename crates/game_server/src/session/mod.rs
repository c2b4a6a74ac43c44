//! Per-connection session state.
//!
//! A [`Session`] is owned by exactly one multiplexer and never crosses task
//! boundaries. Handlers receive it by mutable reference and may flip flags
//! on it (most notably [`SessionFlags::KICKED_OUT`]).

pub mod latch;
pub mod registry;

pub use latch::Latch;
pub use registry::{PushSink, SessionRegistry};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a player as carried on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for UserId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

bitflags! {
    /// Bitmask of session state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u32 {
        /// The session has published a push sink in the registry.
        const REGISTERED = 0x1;
        /// Game logic asked for the client to be disconnected.
        const KICKED_OUT = 0x4;
    }
}

/// State of one player stream.
#[derive(Debug, Default)]
pub struct Session {
    pub flags: SessionFlags,
    pub user_id: UserId,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.flags.contains(SessionFlags::REGISTERED)
    }

    /// Marks the session for disconnection once the current handler returns.
    pub fn kick(&mut self) {
        self.flags.insert(SessionFlags::KICKED_OUT);
    }

    pub fn is_kicked_out(&self) -> bool {
        self.flags.contains(SessionFlags::KICKED_OUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_has_no_flags() {
        let session = Session::new();
        assert_eq!(session.flags.bits(), 0);
        assert!(!session.is_registered());
        assert!(!session.is_kicked_out());
        assert_eq!(session.user_id, UserId(0));
    }

    #[test]
    fn test_flag_bits_match_wire_values() {
        assert_eq!(SessionFlags::REGISTERED.bits(), 0x1);
        assert_eq!(SessionFlags::KICKED_OUT.bits(), 0x4);
    }

    #[test]
    fn test_insert_and_remove_flags() {
        let mut flags = SessionFlags::empty();
        flags.insert(SessionFlags::REGISTERED);
        flags.insert(SessionFlags::KICKED_OUT);
        assert!(flags.contains(SessionFlags::REGISTERED));
        assert!(flags.contains(SessionFlags::KICKED_OUT));

        flags.remove(SessionFlags::REGISTERED);
        assert!(!flags.contains(SessionFlags::REGISTERED));
        assert!(flags.contains(SessionFlags::KICKED_OUT));
    }

    #[test]
    fn test_flags_combine_and_reject_unknown_bits() {
        let both = SessionFlags::REGISTERED | SessionFlags::KICKED_OUT;
        assert_eq!(both.bits(), 0x5);
        assert_eq!(SessionFlags::from_bits(0x5), Some(both));
        assert_eq!(SessionFlags::from_bits(0x2), None);
        assert_eq!(SessionFlags::default(), SessionFlags::empty());
    }

    #[test]
    fn test_kick_sets_flag() {
        let mut session = Session::new();
        session.kick();
        assert!(session.is_kicked_out());
        assert!(!session.is_registered());
    }
}

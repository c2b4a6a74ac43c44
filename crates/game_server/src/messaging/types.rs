//! Frame definitions for client-server communication.
//!
//! A [`Frame`] is the envelope exchanged over a player's stream. It is
//! distinct from the inner game payload: the envelope only carries enough to
//! route the message (its type, the player id for registration, and the
//! opaque payload bytes).
//!
//! On the WebSocket transport each frame travels as one JSON document:
//!
//! ```json
//! { "type": "message", "user_id": 42, "message": "A+kAAAAH" }
//! ```
//!
//! `message` is base64 encoded; `user_id` and `message` may be omitted.

use crate::error::SessionError;
use crate::session::UserId;
use serde::{Deserialize, Serialize};

/// Kind of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Game message routed to protocol dispatch.
    Message,
    /// Binds the frame's `user_id` to this stream.
    Register,
    /// Graceful teardown requested by the client.
    Unregister,
    /// Echoed back unchanged.
    Ping,
    /// Server to client only: the client must disconnect.
    Kick,
}

/// A message sent over a player stream in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,

    #[serde(default)]
    pub user_id: UserId,

    #[serde(default, with = "base64_bytes")]
    pub message: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            user_id: UserId::default(),
            message: Vec::new(),
        }
    }

    pub fn message(payload: Vec<u8>) -> Self {
        Self {
            message: payload,
            ..Self::new(FrameType::Message)
        }
    }

    pub fn register(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::new(FrameType::Register)
        }
    }

    pub fn unregister() -> Self {
        Self::new(FrameType::Unregister)
    }

    pub fn ping(payload: Vec<u8>) -> Self {
        Self {
            message: payload,
            ..Self::new(FrameType::Ping)
        }
    }

    pub fn kick() -> Self {
        Self::new(FrameType::Kick)
    }

    /// Serializes the frame to its JSON wire form.
    pub fn encode(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Codec(e.to_string()))
    }

    /// Parses a frame from its JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Codec(format!("Invalid frame: {e}")))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let frame = Frame {
            frame_type: FrameType::Message,
            user_id: UserId(42),
            message: vec![0x03, 0xE9, 0, 0, 0, 7],
        };
        let json: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["user_id"], 42);
        assert_eq!(json["message"], "A+kAAAAH");
    }

    #[test]
    fn test_optional_fields_default() {
        let frame = Frame::decode(br#"{"type":"unregister"}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Unregister);
        assert_eq!(frame.user_id, UserId(0));
        assert!(frame.message.is_empty());
    }

    #[test]
    fn test_register_frame_carries_user() {
        let frame = Frame::decode(br#"{"type":"register","user_id":1001}"#).unwrap();
        assert_eq!(frame, Frame::register(1001));
    }

    #[test]
    fn test_rejects_unknown_type_and_bad_base64() {
        assert!(matches!(
            Frame::decode(br#"{"type":"teleport"}"#),
            Err(SessionError::Codec(_))
        ));
        assert!(matches!(
            Frame::decode(br#"{"type":"ping","message":"***"}"#),
            Err(SessionError::Codec(_))
        ));
    }
}

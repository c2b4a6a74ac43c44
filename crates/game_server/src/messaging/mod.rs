//! Frame envelope and protocol dispatch.

pub mod router;
pub mod types;

pub use router::{route_message, Handler, HandlerTable, Opcode, PayloadReader};
pub use types::{Frame, FrameType};

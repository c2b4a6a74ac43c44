//! Built-in protocol handlers.

use bytes::BufMut;
use game_server::{HandlerTable, Opcode};

pub const PING_REQ: Opcode = 1001;
pub const PING_ACK: Opcode = 1002;

/// Handler table every node serves: a ping that echoes the caller's id.
pub fn handlers() -> HandlerTable {
    HandlerTable::new().bind(PING_REQ, |_session, payload| {
        let id = payload.read_i32().ok()?;
        let mut reply = Vec::with_capacity(6);
        reply.put_u16(PING_ACK);
        reply.put_i32(id);
        Some(reply)
    })
}

//! Opcode dispatch for `Message` frames.
//!
//! A message payload starts with a 2-byte big-endian opcode. The rest is
//! codec specific and handed to the bound handler through a
//! [`PayloadReader`] positioned just after the opcode.

use crate::error::SessionError;
use bytes::Buf;
use crate::session::{Latch, Session};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Protocol number carried in the first two bytes of a message payload.
pub type Opcode = u16;

/// A protocol handler.
///
/// Handlers may mutate session flags and return an optional response
/// payload, which is sent back to the client as a `Message` frame. They run
/// under the process-wide [`Latch`] and must not block on I/O.
pub type Handler =
    Arc<dyn Fn(&mut Session, &mut PayloadReader<'_>) -> Option<Vec<u8>> + Send + Sync>;

/// Cursor over a message payload.
///
/// Every read checks the remaining length first, so a short payload is a
/// [`SessionError::MalformedMessage`] rather than a panic.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    len: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            buf: data,
            len: data.len(),
        }
    }

    fn ensure(&self, n: usize) -> Result<(), SessionError> {
        if self.buf.remaining() < n {
            return Err(SessionError::MalformedMessage(format!(
                "need {} bytes at offset {}, payload is {} bytes",
                n,
                self.len - self.buf.remaining(),
                self.len
            )));
        }
        Ok(())
    }

    pub fn read_u16(&mut self) -> Result<u16, SessionError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i16(&mut self) -> Result<i16, SessionError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> Result<i32, SessionError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    /// Reads a string prefixed by its u16 byte length.
    pub fn read_string(&mut self) -> Result<String, SessionError> {
        let len = self.read_u16()? as usize;
        self.ensure(len)?;
        let text = self.buf[..len].to_vec();
        self.buf.advance(len);
        String::from_utf8(text).map_err(|e| SessionError::MalformedMessage(e.to_string()))
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

/// Static table of protocol handlers keyed by opcode.
///
/// Built once at startup and shared immutably by every multiplexer.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<Opcode, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `opcode`, replacing any previous binding.
    pub fn bind<F>(mut self, opcode: Opcode, handler: F) -> Self
    where
        F: Fn(&mut Session, &mut PayloadReader<'_>) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers.insert(opcode, Arc::new(handler));
        self
    }

    pub fn get(&self, opcode: Opcode) -> Option<&Handler> {
        self.handlers.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut opcodes: Vec<_> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("HandlerTable").field("opcodes", &opcodes).finish()
    }
}

/// Routes a message payload to its handler.
///
/// # Message Flow
///
/// 1. Reject unless the session is registered
/// 2. Read the opcode and look up the handler
/// 3. Invoke the handler under the latch
///
/// Returns the handler's response payload, if any. No session state is
/// touched on any of the error paths before the handler runs.
pub async fn route_message(
    payload: &[u8],
    session: &mut Session,
    handlers: &HandlerTable,
    latch: &Latch,
) -> Result<Option<Vec<u8>>, SessionError> {
    if !session.is_registered() {
        error!("message received before registration");
        return Err(SessionError::NotRegistered);
    }

    let mut reader = PayloadReader::new(payload);
    let opcode = reader.read_u16()?;
    let handler = handlers.get(opcode).ok_or_else(|| {
        error!("service not bind: {}", opcode);
        SessionError::HandlerNotBound(opcode)
    })?;

    debug!("📨 dispatching opcode {} for user {}", opcode, session.user_id);
    latch
        .run(|| handler(session, &mut reader))
        .await
        .map_err(|panic| {
            error!("handler for opcode {} panicked: {}", opcode, panic);
            SessionError::HandlerPanicked(opcode)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionFlags, UserId};
    use bytes::BufMut;

    fn registered_session() -> Session {
        let mut session = Session::new();
        session.user_id = UserId(11);
        session.flags.insert(SessionFlags::REGISTERED);
        session
    }

    #[test]
    fn test_reader_big_endian_fields() {
        let data = [0x03, 0xE9, 0xFF, 0xFE, 0x00, 0x00, 0x01, 0x00, 0x00, 0x02, b'h', b'i', 9];
        let mut reader = PayloadReader::new(&data);
        assert_eq!(reader.read_u16().unwrap(), 1001);
        assert_eq!(reader.read_i16().unwrap(), -2);
        assert_eq!(reader.read_i32().unwrap(), 256);
        assert_eq!(reader.read_string().unwrap(), "hi");
        assert_eq!(reader.remaining(), &[9]);
    }

    #[test]
    fn test_reader_short_payload() {
        let mut reader = PayloadReader::new(&[0x01]);
        assert!(matches!(reader.read_u16(), Err(SessionError::MalformedMessage(_))));
    }

    #[test]
    fn test_reader_underflow_is_an_error_not_a_panic() {
        let mut payload = Vec::new();
        payload.put_u16(1001);
        payload.put_u16(10);
        payload.put_slice(b"abc");
        let mut reader = PayloadReader::new(&payload);

        assert_eq!(reader.read_u16().unwrap(), 1001);
        assert!(matches!(reader.read_string(), Err(SessionError::MalformedMessage(_))));
        assert!(matches!(reader.read_i32(), Err(SessionError::MalformedMessage(_))));
        assert_eq!(reader.remaining(), b"abc");
        assert_eq!(reader.read_i16().unwrap(), 0x6162);
        assert!(matches!(reader.read_i16(), Err(SessionError::MalformedMessage(_))));
        assert_eq!(reader.remaining(), b"c");
    }

    #[tokio::test]
    async fn test_route_invokes_bound_handler() {
        let table = HandlerTable::new().bind(7, |_session, reader| {
            Some(reader.remaining().iter().rev().copied().collect())
        });
        let latch = Latch::new();
        let mut session = registered_session();

        let reply = route_message(&[0, 7, 1, 2, 3], &mut session, &table, &latch)
            .await
            .unwrap();
        assert_eq!(reply, Some(vec![3, 2, 1]));
        assert_eq!(latch.invocations(), 1);
    }

    #[tokio::test]
    async fn test_route_rejects_unregistered() {
        let table = HandlerTable::new().bind(7, |_s, _r| panic!("must not run"));
        let latch = Latch::new();
        let mut session = Session::new();

        let err = route_message(&[0, 7], &mut session, &table, &latch).await.unwrap_err();
        assert!(matches!(err, SessionError::NotRegistered));
        assert_eq!(latch.invocations(), 0);
    }

    #[tokio::test]
    async fn test_route_unbound_opcode() {
        let table = HandlerTable::new();
        let latch = Latch::new();
        let mut session = registered_session();

        let err = route_message(&[0x00, 0x2A], &mut session, &table, &latch)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HandlerNotBound(42)));
        assert_eq!(session.flags, SessionFlags::REGISTERED);
    }

    #[tokio::test]
    async fn test_route_handler_panic() {
        let table = HandlerTable::new().bind(1, |_s, _r| panic!("logic bug"));
        let latch = Latch::new();
        let mut session = registered_session();

        let err = route_message(&[0, 1], &mut session, &table, &latch).await.unwrap_err();
        assert!(matches!(err, SessionError::HandlerPanicked(1)));
    }
}

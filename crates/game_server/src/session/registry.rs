//! Process-wide directory of live player sessions.
//!
//! The registry maps a [`UserId`] to the [`PushSink`] of the stream that
//! currently owns that player. Any task (or a protocol handler running under
//! the latch) can look a player up and enqueue a frame; the owning
//! multiplexer interleaves it onto the player's outbound stream.
//!
//! Only the owning multiplexer ever writes its own entry. Contents are not
//! persisted; a restarted process starts empty and clients re-register.

use crate::error::PushError;
use crate::messaging::Frame;
use crate::session::UserId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Bounded outbound queue of one live session.
#[derive(Debug, Clone)]
pub struct PushSink {
    tx: mpsc::Sender<Frame>,
}

impl PushSink {
    /// Creates a sink and the receiving half the multiplexer selects on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueues a frame without waiting.
    pub fn try_push(&self, frame: Frame) -> Result<(), PushError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Enqueues a frame, waiting for queue space.
    pub async fn push(&self, frame: Frame) -> Result<(), PushError> {
        self.tx.send(frame).await.map_err(|_| PushError::Closed)
    }

    /// True when both handles feed the same session queue.
    pub fn same_sink(&self, other: &PushSink) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Concurrent `UserId -> PushSink` map guarded by a single reader/writer lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    records: RwLock<HashMap<UserId, PushSink>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `sink` for `id`, returning whatever sink it replaced.
    ///
    /// Overwrite rather than merge: a ghost entry left behind by a previous
    /// ungraceful shutdown is evicted by the next successful registration.
    pub fn register(&self, id: UserId, sink: PushSink) -> Option<PushSink> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let previous = records.insert(id, sink);
        if previous.is_some() {
            debug!("evicted stale push sink for user {}", id);
        }
        previous
    }

    /// Removes the entry for `id` unconditionally.
    pub fn unregister(&self, id: UserId) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(&id).is_some()
    }

    /// Removes the entry for `id` only while it still points at `sink`.
    ///
    /// Session teardown goes through here so that a stream which was
    /// superseded by a newer registration for the same player cannot evict
    /// the newer stream's entry.
    pub fn unregister_if_current(&self, id: UserId, sink: &PushSink) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get(&id) {
            Some(current) if current.same_sink(sink) => {
                records.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn query(&self, id: UserId) -> Option<PushSink> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(&id).cloned()
    }

    /// Number of online players.
    pub fn count(&self) -> usize {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.len()
    }

    /// Looks `id` up and enqueues `frame` without waiting.
    pub fn push(&self, id: UserId, frame: Frame) -> Result<(), PushError> {
        let sink = self.query(id).ok_or(PushError::NotFound(id))?;
        sink.try_push(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::FrameType;

    #[test]
    fn test_register_and_query() {
        let registry = SessionRegistry::new();
        let (sink, _rx) = PushSink::channel(4);

        assert!(registry.query(UserId(7)).is_none());
        assert!(registry.register(UserId(7), sink.clone()).is_none());

        let found = registry.query(UserId(7)).expect("registered sink");
        assert!(found.same_sink(&sink));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_overwrites_stale_entry() {
        let registry = SessionRegistry::new();
        let (ghost, _ghost_rx) = PushSink::channel(4);
        let (fresh, _fresh_rx) = PushSink::channel(4);

        registry.register(UserId(1), ghost.clone());
        let evicted = registry.register(UserId(1), fresh.clone()).expect("evicted ghost");

        assert!(evicted.same_sink(&ghost));
        assert!(registry.query(UserId(1)).unwrap().same_sink(&fresh));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_unregister_is_unconditional() {
        let registry = SessionRegistry::new();
        let (sink, _rx) = PushSink::channel(4);
        registry.register(UserId(3), sink);

        assert!(registry.unregister(UserId(3)));
        assert!(!registry.unregister(UserId(3)));
        assert!(registry.query(UserId(3)).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_unregister_if_current_spares_newer_sink() {
        let registry = SessionRegistry::new();
        let (old, _old_rx) = PushSink::channel(4);
        let (new, _new_rx) = PushSink::channel(4);

        registry.register(UserId(9), old.clone());
        registry.register(UserId(9), new.clone());

        assert!(!registry.unregister_if_current(UserId(9), &old));
        assert!(registry.query(UserId(9)).unwrap().same_sink(&new));

        assert!(registry.unregister_if_current(UserId(9), &new));
        assert!(registry.query(UserId(9)).is_none());
    }

    #[tokio::test]
    async fn test_push_delivers_in_order() {
        let registry = SessionRegistry::new();
        let (sink, mut rx) = PushSink::channel(4);
        registry.register(UserId(5), sink);

        registry.push(UserId(5), Frame::message(vec![0, 1])).unwrap();
        registry.push(UserId(5), Frame::message(vec![0, 2])).unwrap();

        assert_eq!(rx.recv().await.unwrap().message, vec![0, 1]);
        assert_eq!(rx.recv().await.unwrap().message, vec![0, 2]);
    }

    #[test]
    fn test_push_reports_missing_full_and_closed() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.push(UserId(2), Frame::ping(Vec::new())),
            Err(PushError::NotFound(UserId(2)))
        );

        let (sink, rx) = PushSink::channel(1);
        registry.register(UserId(2), sink);
        registry.push(UserId(2), Frame::ping(Vec::new())).unwrap();
        assert_eq!(
            registry.push(UserId(2), Frame::ping(Vec::new())),
            Err(PushError::Full)
        );

        drop(rx);
        let err = registry.push(UserId(2), Frame::new(FrameType::Kick)).unwrap_err();
        assert_eq!(err, PushError::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_readers_and_writers() {
        use std::sync::Arc;

        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (sink, _rx) = PushSink::channel(1);
                registry.register(UserId(i), sink);
                assert!(registry.query(UserId(i)).is_some());
                registry.count()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.count(), 16);
    }
}

//! In-process transport.
//!
//! [`frame_channel`] returns a client handle plus the receiver/sender pair
//! a multiplexer runs on. Used for embedding a session in another task and
//! for driving sessions in tests without sockets.

use super::{FrameReceiver, FrameSender};
use crate::error::SessionError;
use crate::messaging::Frame;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Server-side inbound half backed by a channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::Receiver<Result<Frame, SessionError>>,
}

/// Server-side outbound half backed by a channel.
#[derive(Debug)]
pub struct ChannelSender {
    tx: mpsc::Sender<Frame>,
}

/// The client end of an in-process stream.
#[derive(Debug)]
pub struct ClientStream {
    tx: Option<mpsc::Sender<Result<Frame, SessionError>>>,
    rx: mpsc::Receiver<Frame>,
}

/// Creates a connected in-process stream with `capacity` slots per direction.
pub fn frame_channel(capacity: usize) -> (ClientStream, ChannelReceiver, ChannelSender) {
    let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
    (
        ClientStream {
            tx: Some(in_tx),
            rx: out_rx,
        },
        ChannelReceiver { rx: in_rx },
        ChannelSender { tx: out_tx },
    )
}

#[async_trait]
impl FrameReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Result<Option<Frame>, SessionError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FrameSender for ChannelSender {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SessionError::Transport("client stream closed".to_string()))
    }
}

impl ClientStream {
    /// Sends a frame to the server.
    pub async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.inject(Ok(frame)).await
    }

    /// Makes the server's next receive fail with `error`.
    pub async fn fail(&self, error: SessionError) -> Result<(), SessionError> {
        self.inject(Err(error)).await
    }

    async fn inject(&self, item: Result<Frame, SessionError>) -> Result<(), SessionError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SessionError::Transport("client stream closed".to_string()))?;
        tx.send(item)
            .await
            .map_err(|_| SessionError::Transport("server stream closed".to_string()))
    }

    /// Receives the next frame sent by the server, `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Signals end-of-stream to the server while still accepting its output.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Resolves once the server side stopped reading from this stream.
    pub async fn server_gone(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_close() {
        let (mut client, mut receiver, mut sender) = frame_channel(4);

        client.send(Frame::ping(vec![1])).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), Some(Frame::ping(vec![1])));

        sender.send(Frame::kick()).await.unwrap();
        assert_eq!(client.recv().await, Some(Frame::kick()));

        client.close();
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (client, mut receiver, _sender) = frame_channel(1);
        client
            .fail(SessionError::Transport("reset".to_string()))
            .await
            .unwrap();
        assert!(matches!(receiver.recv().await, Err(SessionError::Transport(_))));
    }
}

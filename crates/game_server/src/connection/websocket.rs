//! WebSocket transport for player streams.
//!
//! Each WebSocket message carries exactly one JSON encoded [`Frame`]. Text
//! and binary messages are both accepted inbound; outbound frames are sent
//! as text.

use super::{FrameReceiver, FrameSender};
use crate::error::SessionError;
use crate::messaging::Frame;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{trace, warn};

/// Inbound half of a WebSocket player stream.
pub struct WebSocketReceiver<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Outbound half of a WebSocket player stream.
pub struct WebSocketSender<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Splits an established WebSocket into the halves a multiplexer runs on.
pub fn split<S>(ws: WebSocketStream<S>) -> (WebSocketReceiver<S>, WebSocketSender<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (
        WebSocketReceiver { inner: stream },
        WebSocketSender { inner: sink },
    )
}

#[async_trait]
impl<S> FrameReceiver for WebSocketReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, SessionError> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Text(text)) => return Frame::decode(text.as_bytes()).map(Some),
                Ok(Message::Binary(data)) => return Frame::decode(&data).map(Some),
                Ok(Message::Close(_)) => {
                    trace!("client sent close");
                    return Ok(None);
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // tungstenite answers pings on the next write/flush
                }
                Ok(other) => {
                    warn!("Received unsupported message type: {:?}", other);
                }
                Err(e) => return Err(SessionError::Transport(e.to_string())),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<S> FrameSender for WebSocketSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        let text = frame.encode()?;
        self.inner
            .send(Message::text(text))
            .await
            .map_err(|e| SessionError::Transport(format!("Failed to send frame: {e}")))
    }
}

//! Per-connection handling.

use crate::connection::{websocket, ClientConnection, StreamMultiplexer};
use crate::error::ServerError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, Instrument};

/// Upgrades `stream` to a WebSocket and runs one player stream over it.
///
/// The handshake must complete within `handshake_timeout`. The returned
/// error is whatever ended the stream; registry cleanup has already run.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    multiplexer: StreamMultiplexer,
    handshake_timeout: Duration,
) -> Result<(), ServerError> {
    let client = ClientConnection::new(addr);
    let span = tracing::info_span!("connection", id = %client.id, peer = %addr);

    async move {
        let ws = tokio::time::timeout(handshake_timeout, accept_async(stream))
            .await
            .map_err(|_| ServerError::Network("WebSocket handshake timed out".to_string()))?
            .map_err(|e| ServerError::Network(format!("WebSocket handshake failed: {e}")))?;

        info!("🔗 New connection");
        let (receiver, sender) = websocket::split(ws);
        let result = multiplexer.run(receiver, sender).await;

        debug!("connection closed after {:?}", client.age());
        result.map_err(ServerError::from)
    }
    .instrument(span)
    .await
}

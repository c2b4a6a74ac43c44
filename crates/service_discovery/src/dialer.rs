//! Connecting to discovered instances.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Opens connections to the addresses published in the store.
///
/// The pool hands out clones of `Connection`; an instance's connection
/// is closed once the pool drops it and every clone handed out is gone.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    async fn dial(&self, address: &str) -> Result<Self::Connection, DiscoveryError>;
}

/// Dials plain TCP with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// A shared TCP connection to one service instance.
#[derive(Debug, Clone)]
pub struct ServiceConnection {
    address: String,
    stream: Arc<Mutex<TcpStream>>,
    connected_at: Instant,
}

impl ServiceConnection {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Writes all of `data`, serialized against other users of the connection.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(data).await?;
        stream.flush().await
    }

    /// Reads whatever is available into `buf`; `Ok(0)` means the peer closed.
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.lock().await.read(buf).await
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Connection = ServiceConnection;

    async fn dial(&self, address: &str) -> Result<ServiceConnection, DiscoveryError> {
        let dial_error = |reason: String| DiscoveryError::Dial {
            address: address.to_string(),
            reason,
        };
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| dial_error(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| dial_error(e.to_string()))?;
        stream.set_nodelay(true).ok();
        debug!("dialed {}", address);

        Ok(ServiceConnection {
            address: address.to_string(),
            stream: Arc::new(Mutex::new(stream)),
            connected_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let conn = TcpDialer::new(Duration::from_secs(1)).dial(&addr).await.unwrap();
        assert_eq!(conn.address(), addr);
        conn.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            let n = conn.receive(&mut buf[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpDialer::new(Duration::from_secs(1)).dial(&addr).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Dial { .. }));
    }

    #[tokio::test]
    async fn test_dial_garbage_address() {
        let err = TcpDialer::new(Duration::from_secs(1))
            .dial("not an address")
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Dial { .. }));
    }
}

//! Core game server implementation.
//!
//! This module contains the main `GameServer` struct: listener setup, the
//! accept loops and the shared state every player stream runs against.

use crate::{
    config::ServerConfig,
    connection::StreamMultiplexer,
    error::ServerError,
    messaging::HandlerTable,
    server::handlers::handle_connection,
    session::{Latch, SessionRegistry},
};
use futures::stream::{FuturesUnordered, StreamExt as FuturesStreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Delay before an accept loop retries after a failed `accept`.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The core game server structure.
///
/// `GameServer` owns the session registry, the protocol handler table and
/// the global latch. Every accepted connection gets its own run of the
/// shared [`StreamMultiplexer`]; all of them observe the same shutdown
/// token, so [`GameServer::shutdown`] kicks every connected player.
///
/// # Architecture
///
/// * **Registry**: user id to push queue, shared with game logic
/// * **Latch**: serializes every handler invocation across sessions
/// * **Multi-threaded Networking**: configurable accept loop scaling
pub struct GameServer {
    /// Server configuration settings
    config: ServerConfig,

    /// Shared per-stream context
    multiplexer: StreamMultiplexer,

    /// Cancelled once the server is asked to stop
    shutdown: CancellationToken,

    /// Number of connections currently holding a slot
    active_connections: Arc<AtomicUsize>,
}

/// One of `max_connections` slots, released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(counter.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl GameServer {
    /// Creates a new game server with the specified configuration and
    /// protocol handlers.
    ///
    /// The handler table is frozen from here on; the server is ready to
    /// start after construction.
    pub fn new(config: ServerConfig, handlers: HandlerTable) -> Self {
        let shutdown = CancellationToken::new();
        let multiplexer = StreamMultiplexer::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(handlers),
            Arc::new(Latch::new()),
        )
        .with_push_queue_capacity(config.push_queue_capacity)
        .with_shutdown(shutdown.clone());

        Self {
            config,
            multiplexer,
            shutdown,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Starts the game server and begins accepting connections.
    ///
    /// Binds the configured address and runs the accept loops until
    /// [`GameServer::shutdown`] is called.
    ///
    /// If `use_reuse_port` is enabled in configuration, the server will
    /// create multiple accept loops equal to the number of CPU cores for
    /// better load distribution.
    pub async fn start(&self) -> Result<(), ServerError> {
        info!("🚀 Starting game server on {}", self.config.bind_address);
        let listeners = self.bind_listeners()?;
        self.serve(listeners).await
    }

    fn bind_listeners(&self) -> Result<Vec<TcpListener>, ServerError> {
        // Determine number of accept loops based on configuration
        let core_count = num_cpus::get();
        let num_acceptors = if self.config.use_reuse_port {
            core_count
        } else {
            1
        };

        info!(
            "🧠 Detected {} CPU cores, using {} acceptor(s)",
            core_count, num_acceptors
        );

        let mut listeners = Vec::with_capacity(num_acceptors);
        for i in 0..num_acceptors {
            let socket = Socket::new(
                Domain::for_address(self.config.bind_address),
                Type::STREAM,
                Some(Protocol::TCP),
            )
            .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
            socket.set_reuse_address(true).ok();

            if self.config.use_reuse_port {
                #[cfg(unix)]
                match socket.set_reuse_port(true) {
                    Ok(()) => info!("SO_REUSEPORT enabled for load balancing across acceptor threads"),
                    Err(e) => warn!("Failed to set SO_REUSEPORT: {}", e),
                }
                #[cfg(not(unix))]
                warn!("SO_REUSEPORT is not supported on this platform. Using SO_REUSEADDR only.");
            }

            socket
                .bind(&self.config.bind_address.into())
                .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
            socket
                .listen(65535)
                .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

            let std_listener: StdTcpListener = socket.into();
            std_listener
                .set_nonblocking(true)
                .map_err(|e| ServerError::Network(format!("Set nonblocking failed: {e}")))?;

            let listener = TcpListener::from_std(std_listener)
                .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))?;

            listeners.push(listener);
            info!("✅ Listener {} bound on {}", i, self.config.bind_address);
        }
        Ok(listeners)
    }

    /// Runs accept loops over already bound listeners until shutdown.
    pub async fn serve(&self, listeners: Vec<TcpListener>) -> Result<(), ServerError> {
        if listeners.is_empty() {
            return Err(ServerError::Internal("no listeners to serve".to_string()));
        }

        let mut accept_futures = listeners
            .into_iter()
            .map(|listener| self.accept_loop(listener))
            .collect::<FuturesUnordered<_>>();

        // Run until shutdown
        tokio::select! {
            _ = accept_futures.next() => {}
            _ = self.shutdown.cancelled() => {
                info!("Shutdown signal received");
            }
        }

        info!("Server stopped");
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let max_connections = self.config.max_connections;
        let handshake_timeout = self.config.handshake_timeout();

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => return,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let Some(slot) = ConnectionSlot::acquire(&self.active_connections, max_connections)
                    else {
                        warn!("Connection limit {} reached, rejecting {}", max_connections, addr);
                        drop(stream);
                        continue;
                    };
                    let multiplexer = self.multiplexer.clone();

                    // Spawn individual connection handler
                    tokio::spawn(async move {
                        let _slot = slot;
                        if let Err(e) =
                            handle_connection(stream, addr, multiplexer, handshake_timeout).await
                        {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Initiates server shutdown.
    ///
    /// Stops the accept loops and kicks every connected player.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        info!("🛑 Shutting down server...");
        self.shutdown.cancel();
        Ok(())
    }

    /// The registry game logic uses to look up and push to players.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.multiplexer.registry().clone()
    }

    pub fn latch(&self) -> Arc<Latch> {
        self.multiplexer.latch().clone()
    }

    /// The shared per-stream context, for running streams over other transports.
    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.multiplexer
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of registered players.
    pub fn online_count(&self) -> usize {
        self.multiplexer.registry().count()
    }

    /// Number of open connections, registered or not.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_slots_are_bounded_and_released() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&counter, 2).unwrap();
        let _second = ConnectionSlot::acquire(&counter, 2).unwrap();
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());

        drop(first);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        assert!(ConnectionSlot::acquire(&counter, 2).is_some());
    }

    #[tokio::test]
    async fn test_serve_returns_after_shutdown() {
        let server = Arc::new(GameServer::new(ServerConfig::default(), HandlerTable::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = tokio::spawn({
            let server = server.clone();
            async move { server.serve(vec![listener]).await }
        });
        server.shutdown().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(server.online_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_without_listeners_fails() {
        let server = GameServer::new(ServerConfig::default(), HandlerTable::new());
        assert!(matches!(server.serve(Vec::new()).await, Err(ServerError::Internal(_))));
    }
}

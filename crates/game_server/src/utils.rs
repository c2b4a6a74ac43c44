//! Convenience constructors for [`GameServer`].

use crate::{config::ServerConfig, messaging::HandlerTable, server::GameServer};

/// Creates a server with the default configuration.
pub fn create_server(handlers: HandlerTable) -> GameServer {
    GameServer::new(ServerConfig::default(), handlers)
}

/// Creates a server with a custom configuration.
pub fn create_server_with_config(config: ServerConfig, handlers: HandlerTable) -> GameServer {
    GameServer::new(config, handlers)
}

//! Configuration management for a game node.
//!
//! This module handles loading, validation, and CLI overrides of the node
//! configuration stored as TOML.

use crate::cli::Args;
use anyhow::{bail, Context, Result};
use game_server::ServerConfig;
use serde::{Deserialize, Serialize};
use service_discovery::{DiscoveryConfig, DiscoveryError, MemoryStore};
use std::path::Path;
use tracing::info;

/// Application configuration loaded from a TOML file.
///
/// ```toml
/// [server]
/// bind_address = "127.0.0.1:10000"
///
/// [discovery]
/// root = "/backends"
///
/// [[discovery.instances]]
/// service = "snowflake"
/// id = "s1"
/// address = "127.0.0.1:50003"
///
/// [logging]
/// level = "info"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Player stream endpoint settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend discovery settings
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Pool configuration plus the membership this node starts out with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(flatten)]
    pub pool: DiscoveryConfig,
    /// Instances published into the coordination store at startup
    #[serde(default)]
    pub instances: Vec<InstanceSettings>,
}

/// One backend instance, stored as `root/service/id -> address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSettings {
    pub service: String,
    pub id: String,
    pub address: String,
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing a default file there first
    /// if none exists.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides on top of the file settings.
    pub fn apply_overrides(&mut self, args: &Args) -> Result<()> {
        if let Some(bind) = &args.bind {
            self.server.bind_address = bind
                .parse()
                .with_context(|| format!("Invalid bind address: {bind}"))?;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        if !args.services.is_empty() {
            self.discovery.pool.names = args.services.clone();
        }
        Ok(())
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than zero");
        }
        if self.server.push_queue_capacity == 0 {
            bail!("push_queue_capacity must be greater than zero");
        }
        if !self.discovery.pool.root.starts_with('/') {
            bail!(
                "Discovery root must be an absolute key: {}",
                self.discovery.pool.root
            );
        }
        for instance in &self.discovery.instances {
            if instance.service.is_empty() || instance.id.is_empty() {
                bail!("Discovery instance needs a service and an id: {:?}", instance);
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            );
        }
        Ok(())
    }
}

impl DiscoverySettings {
    /// Publishes the configured instances into `store`.
    pub fn seed(&self, store: &MemoryStore) -> Result<(), DiscoveryError> {
        for instance in &self.instances {
            let key = format!("{}/{}/{}", self.pool.root, instance.service, instance.id);
            store.set(&key, &instance.address)?;
        }
        Ok(())
    }
}

//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for a game node.
///
/// Every option except `--config` overrides the matching setting of the
/// configuration file.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// If the file doesn't exist, a default configuration is written there.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Bind address (e.g., 127.0.0.1:10000)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Comma separated service names to accept from discovery
    #[arg(short, long, value_delimiter = ',')]
    pub services: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["game_node"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert!(args.bind.is_none());
        assert!(!args.json_logs);
        assert!(args.services.is_empty());
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "game_node",
            "--config",
            "/etc/node.toml",
            "--bind",
            "0.0.0.0:9000",
            "--log-level",
            "debug",
            "--json-logs",
            "--services",
            "snowflake,chat",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/node.toml"));
        assert_eq!(args.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert_eq!(args.services, vec!["snowflake", "chat"]);
    }
}

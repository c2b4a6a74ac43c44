//! Discovery configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where membership lives in the coordination store and how the pool
/// follows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory holding `root/serviceName/instanceId -> address` entries
    #[serde(default = "default_root")]
    pub root: String,

    /// Newline separated list of accepted service names, read when `names`
    /// is empty
    #[serde(default = "default_names_path")]
    pub names_path: String,

    /// Accepted service names; empty means read `names_path`
    #[serde(default)]
    pub names: Vec<String>,

    /// Delay before a failed watch is re-established
    #[serde(default = "default_watch_retry_delay")]
    pub watch_retry_delay_ms: u64,

    /// Upper bound on a single dial
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,
}

fn default_root() -> String {
    "/backends".to_string()
}

fn default_names_path() -> String {
    "/backends/names".to_string()
}

fn default_watch_retry_delay() -> u64 {
    1000
}

fn default_dial_timeout() -> u64 {
    3000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            names_path: default_names_path(),
            names: Vec::new(),
            watch_retry_delay_ms: default_watch_retry_delay(),
            dial_timeout_ms: default_dial_timeout(),
        }
    }
}

impl DiscoveryConfig {
    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.root, "/backends");
        assert_eq!(config.names_path, "/backends/names");
        assert!(config.names.is_empty());
        assert_eq!(config.watch_retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: DiscoveryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DiscoveryConfig::default());
    }
}

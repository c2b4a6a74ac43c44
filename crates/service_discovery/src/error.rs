//! Error types for the coordination store and the service pool.

/// Failures reported by a [`CoordinationStore`](crate::CoordinationStore),
/// a [`Dialer`](crate::Dialer) or the pool itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// The key does not exist. `index` is the store index at the time of
    /// the lookup, so a caller can still start a watch from it.
    #[error("key not found: {key}")]
    KeyNotFound { key: String, index: u64 },

    #[error("key already exists: {0}")]
    KeyExists(String),

    /// A value operation targeted a directory.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// A key would be nested under an existing value.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("compare failed on {key}: expected {expected:?}, found {actual:?}")]
    CompareFailed {
        key: String,
        expected: String,
        actual: String,
    },

    /// The events a watch asked for are no longer retained.
    #[error("event index cleared: requested {requested}, oldest retained {oldest}")]
    IndexCleared { requested: u64, oldest: u64 },

    /// A watcher fell behind the live event feed and missed events.
    #[error("watch lagged behind by {0} events")]
    WatchLagged(u64),

    #[error("failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("store error: {0}")]
    Store(String),
}

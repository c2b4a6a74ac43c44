//! Coordination store abstraction.
//!
//! Membership lives in a hierarchical, watch-capable key/value store laid
//! out as `root/serviceName/instanceId -> dialableAddress`. Every mutation
//! is stamped with a monotonically increasing index; a watch started after
//! index `n` sees exactly the mutations with index greater than `n`.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Kind of mutation carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchAction {
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    Expire,
}

impl WatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchAction::Set => "set",
            WatchAction::Create => "create",
            WatchAction::Update => "update",
            WatchAction::CompareAndSwap => "compareAndSwap",
            WatchAction::Delete => "delete",
            WatchAction::Expire => "expire",
        }
    }

    /// Whether the key holds a (possibly new) value after this action.
    pub fn is_put(&self) -> bool {
        matches!(
            self,
            WatchAction::Set | WatchAction::Create | WatchAction::Update | WatchAction::CompareAndSwap
        )
    }

    /// Whether the key is gone after this action.
    pub fn is_removal(&self) -> bool {
        matches!(self, WatchAction::Delete | WatchAction::Expire)
    }
}

impl fmt::Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    /// New value for puts, empty for removals and directories
    pub value: String,
    pub dir: bool,
    pub index: u64,
}

/// A key in the store, either a value or a directory of further nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub key: String,
    pub value: String,
    pub dir: bool,
    pub nodes: Vec<Node>,
}

impl Node {
    /// All value nodes at or below this node, depth first.
    pub fn leaves(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Node>) {
        if !self.dir {
            out.push(self);
            return;
        }
        for child in &self.nodes {
            child.collect_leaves(out);
        }
    }
}

/// Result of a read: the node plus the store index it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub index: u64,
    pub node: Node,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, DiscoveryError>>;

/// A watch-capable hierarchical key/value store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Reads `path`. Directories list their children, all the way down when
    /// `recursive` is set.
    async fn get(&self, path: &str, recursive: bool) -> Result<Snapshot, DiscoveryError>;

    /// Streams every mutation at or below `path` with an index greater than
    /// `after_index`.
    ///
    /// Fails with [`DiscoveryError::IndexCleared`] when those events are no
    /// longer retained. The stream ends or yields an error when the watch
    /// breaks; callers re-watch from the last index they saw.
    async fn watch(&self, path: &str, after_index: u64) -> Result<WatchStream, DiscoveryError>;
}

/// Canonical form of a key: leading slash, no empty segments, no trailing
/// slash. The root directory is `/`.
pub fn normalize_key(key: &str) -> String {
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Whether `key` lies strictly below directory `dir`. Both must be normalized.
pub fn is_below(key: &str, dir: &str) -> bool {
    if dir == "/" {
        return key != "/";
    }
    key.len() > dir.len() && key.starts_with(dir) && key.as_bytes()[dir.len()] == b'/'
}

/// Joins a normalized directory and a single segment.
pub fn join_key(dir: &str, segment: &str) -> String {
    if dir == "/" {
        format!("/{segment}")
    } else {
        format!("{dir}/{segment}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("backends//game/"), "/backends/game");
        assert_eq!(normalize_key("/"), "/");
        assert_eq!(normalize_key(""), "/");
    }

    #[test]
    fn test_is_below() {
        assert!(is_below("/backends/game/g1", "/backends"));
        assert!(!is_below("/backends2/game", "/backends"));
        assert!(!is_below("/backends", "/backends"));
        assert!(is_below("/backends", "/"));
    }

    #[test]
    fn test_leaves_walks_whole_tree() {
        let tree = Node {
            key: "/b".into(),
            dir: true,
            nodes: vec![
                Node {
                    key: "/b/names".into(),
                    value: "game".into(),
                    ..Node::default()
                },
                Node {
                    key: "/b/game".into(),
                    dir: true,
                    nodes: vec![Node {
                        key: "/b/game/g1".into(),
                        value: "10.0.0.1:80".into(),
                        ..Node::default()
                    }],
                    ..Node::default()
                },
            ],
            ..Node::default()
        };
        let keys: Vec<_> = tree.leaves().iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/b/names", "/b/game/g1"]);
    }
}

//! In-process coordination store.
//!
//! Directories are implicit: a directory exists while at least one value
//! lives below it. Every mutation bumps the store index, is appended to a
//! bounded history and fanned out to live watchers. Watchers subscribe
//! under the same lock that stamps indexes, so a watch started after index
//! `n` never misses or repeats an event.

use crate::error::DiscoveryError;
use crate::store::{
    is_below, join_key, normalize_key, CoordinationStore, Node, Snapshot, WatchAction, WatchEvent,
    WatchStream,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

/// Number of past events kept for watches that start behind the head.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

const LIVE_EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct StoreState {
    index: u64,
    values: BTreeMap<String, String>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
}

/// A complete in-memory [`CoordinationStore`]. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(LIVE_EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(StoreState {
                index: 0,
                values: BTreeMap::new(),
                history: VecDeque::new(),
                history_limit: history_limit.max(1),
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index of the most recent mutation, 0 for a fresh store.
    pub fn current_index(&self) -> u64 {
        self.lock().index
    }

    /// Writes `value` at `key`, creating or overwriting it.
    pub fn set(&self, key: &str, value: &str) -> Result<u64, DiscoveryError> {
        let key = normalize_key(key);
        let mut state = self.lock();
        check_writable(&state, &key)?;
        state.values.insert(key.clone(), value.to_string());
        Ok(self.record(&mut state, WatchAction::Set, key, value.to_string(), false))
    }

    /// Writes `value` at `key`, failing if the key already exists.
    pub fn create(&self, key: &str, value: &str) -> Result<u64, DiscoveryError> {
        let key = normalize_key(key);
        let mut state = self.lock();
        if state.values.contains_key(&key) {
            return Err(DiscoveryError::KeyExists(key));
        }
        check_writable(&state, &key)?;
        state.values.insert(key.clone(), value.to_string());
        Ok(self.record(&mut state, WatchAction::Create, key, value.to_string(), false))
    }

    /// Overwrites an existing value.
    pub fn update(&self, key: &str, value: &str) -> Result<u64, DiscoveryError> {
        let key = normalize_key(key);
        let mut state = self.lock();
        let slot = value_slot(&mut state, &key)?;
        *slot = value.to_string();
        Ok(self.record(&mut state, WatchAction::Update, key, value.to_string(), false))
    }

    /// Overwrites an existing value only if it currently equals `expected`.
    pub fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<u64, DiscoveryError> {
        let key = normalize_key(key);
        let mut state = self.lock();
        let slot = value_slot(&mut state, &key)?;
        if slot != expected {
            return Err(DiscoveryError::CompareFailed {
                key,
                expected: expected.to_string(),
                actual: slot.clone(),
            });
        }
        *slot = value.to_string();
        Ok(self.record(&mut state, WatchAction::CompareAndSwap, key, value.to_string(), false))
    }

    /// Removes a single value.
    pub fn delete(&self, key: &str) -> Result<u64, DiscoveryError> {
        self.remove_value(key, WatchAction::Delete)
    }

    /// Removes a single value as if its TTL ran out.
    pub fn expire(&self, key: &str) -> Result<u64, DiscoveryError> {
        self.remove_value(key, WatchAction::Expire)
    }

    fn remove_value(&self, key: &str, action: WatchAction) -> Result<u64, DiscoveryError> {
        let key = normalize_key(key);
        let mut state = self.lock();
        value_slot(&mut state, &key)?;
        state.values.remove(&key);
        Ok(self.record(&mut state, action, key, String::new(), false))
    }

    /// Removes a directory and everything below it as one mutation.
    pub fn delete_dir(&self, key: &str) -> Result<u64, DiscoveryError> {
        let key = normalize_key(key);
        let mut state = self.lock();
        if state.values.contains_key(&key) {
            return Err(DiscoveryError::NotADirectory(key));
        }
        let doomed: Vec<String> = state
            .values
            .keys()
            .filter(|k| is_below(k, &key))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Err(DiscoveryError::KeyNotFound {
                key,
                index: state.index,
            });
        }
        for k in &doomed {
            state.values.remove(k);
        }
        Ok(self.record(&mut state, WatchAction::Delete, key, String::new(), true))
    }

    fn record(
        &self,
        state: &mut StoreState,
        action: WatchAction,
        key: String,
        value: String,
        dir: bool,
    ) -> u64 {
        state.index += 1;
        let event = WatchEvent {
            action,
            key,
            value,
            dir,
            index: state.index,
        };
        trace!("store {} {} @{}", event.action, event.key, event.index);
        state.history.push_back(event.clone());
        while state.history.len() > state.history_limit {
            state.history.pop_front();
        }
        // no live watchers is fine
        let _ = self.events.send(event);
        state.index
    }
}

/// Rejects writes to a directory or below an existing value.
fn check_writable(state: &StoreState, key: &str) -> Result<(), DiscoveryError> {
    if key == "/" || state.values.keys().any(|k| is_below(k, key)) {
        return Err(DiscoveryError::NotAFile(key.to_string()));
    }
    if let Some(ancestor) = state.values.keys().find(|k| is_below(key, k)) {
        return Err(DiscoveryError::NotADirectory(ancestor.clone()));
    }
    Ok(())
}

fn value_slot<'a>(state: &'a mut StoreState, key: &str) -> Result<&'a mut String, DiscoveryError> {
    let index = state.index;
    let is_dir = state.values.keys().any(|k| is_below(k, key));
    match state.values.get_mut(key) {
        Some(slot) => Ok(slot),
        None if is_dir => Err(DiscoveryError::NotAFile(key.to_string())),
        None => Err(DiscoveryError::KeyNotFound {
            key: key.to_string(),
            index,
        }),
    }
}

/// Builds the directory node for `dir` out of the values below it.
fn build_dir(values: &BTreeMap<String, String>, dir: &str, recursive: bool) -> Node {
    let mut children: BTreeMap<String, Option<&String>> = BTreeMap::new();
    for (key, value) in values.iter().filter(|(k, _)| is_below(k, dir)) {
        let rest = if dir == "/" { &key[1..] } else { &key[dir.len() + 1..] };
        match rest.split_once('/') {
            None => {
                children.insert(join_key(dir, rest), Some(value));
            }
            Some((segment, _)) => {
                children.entry(join_key(dir, segment)).or_insert(None);
            }
        }
    }

    let nodes = children
        .into_iter()
        .map(|(key, value)| match value {
            Some(value) => Node {
                key,
                value: value.clone(),
                dir: false,
                nodes: Vec::new(),
            },
            None if recursive => build_dir(values, &key, true),
            None => Node {
                key,
                dir: true,
                ..Node::default()
            },
        })
        .collect();

    Node {
        key: dir.to_string(),
        value: String::new(),
        dir: true,
        nodes,
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str, recursive: bool) -> Result<Snapshot, DiscoveryError> {
        let path = normalize_key(path);
        let state = self.lock();
        let node = if let Some(value) = state.values.get(&path) {
            Node {
                key: path,
                value: value.clone(),
                dir: false,
                nodes: Vec::new(),
            }
        } else if path == "/" || state.values.keys().any(|k| is_below(k, &path)) {
            build_dir(&state.values, &path, recursive)
        } else {
            return Err(DiscoveryError::KeyNotFound {
                key: path,
                index: state.index,
            });
        };
        Ok(Snapshot {
            index: state.index,
            node,
        })
    }

    async fn watch(&self, path: &str, after_index: u64) -> Result<WatchStream, DiscoveryError> {
        let path = normalize_key(path);
        let matches = {
            let path = path.clone();
            move |event: &WatchEvent| event.key == path || is_below(&event.key, &path)
        };

        let (backlog, live) = {
            let state = self.lock();
            if after_index < state.index {
                let requested = after_index + 1;
                let oldest = state
                    .history
                    .front()
                    .map(|e| e.index)
                    .unwrap_or(state.index + 1);
                if oldest > requested {
                    return Err(DiscoveryError::IndexCleared { requested, oldest });
                }
            }
            let backlog: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|e| e.index > after_index && matches(*e))
                .cloned()
                .collect();
            (backlog, self.events.subscribe())
        };

        let live = stream::unfold(Some(live), move |receiver| {
            let matches = matches.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(event) if event.index > after_index && matches(&event) => {
                            return Some((Ok(event), Some(receiver)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            return Some((Err(DiscoveryError::WatchLagged(missed)), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(stream: &mut WatchStream) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_value_and_directories() {
        let store = MemoryStore::new();
        store.set("/backends/game/g1", "10.0.0.1:80").unwrap();
        store.set("/backends/game/g2", "10.0.0.2:80").unwrap();
        store.set("/backends/names", "game").unwrap();

        let value = store.get("/backends/game/g1", false).await.unwrap();
        assert_eq!(value.node.value, "10.0.0.1:80");
        assert_eq!(value.index, 3);

        let shallow = store.get("/backends", false).await.unwrap().node;
        assert!(shallow.dir);
        let keys: Vec<_> = shallow.nodes.iter().map(|n| (n.key.as_str(), n.dir)).collect();
        assert_eq!(keys, vec![("/backends/game", true), ("/backends/names", false)]);
        assert!(shallow.nodes[0].nodes.is_empty());

        let deep = store.get("/backends", true).await.unwrap().node;
        let leaves: Vec<_> = deep.leaves().iter().map(|n| n.key.clone()).collect();
        assert_eq!(
            leaves,
            vec!["/backends/game/g1", "/backends/game/g2", "/backends/names"]
        );
    }

    #[tokio::test]
    async fn test_missing_key_reports_index() {
        let store = MemoryStore::new();
        store.set("/other", "x").unwrap();
        let err = store.get("/backends", true).await.unwrap_err();
        assert_eq!(
            err,
            DiscoveryError::KeyNotFound {
                key: "/backends".to_string(),
                index: 1
            }
        );
    }

    #[test]
    fn test_write_conflicts() {
        let store = MemoryStore::new();
        store.set("/a/b", "1").unwrap();
        assert!(matches!(store.set("/a", "x"), Err(DiscoveryError::NotAFile(_))));
        assert!(matches!(store.set("/a/b/c", "x"), Err(DiscoveryError::NotADirectory(_))));
        assert!(matches!(store.create("/a/b", "2"), Err(DiscoveryError::KeyExists(_))));
        assert!(matches!(store.update("/a/z", "2"), Err(DiscoveryError::KeyNotFound { .. })));
        assert!(matches!(
            store.compare_and_swap("/a/b", "nope", "2"),
            Err(DiscoveryError::CompareFailed { .. })
        ));
        assert_eq!(store.compare_and_swap("/a/b", "1", "2").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_watch_replays_history_then_follows_live() {
        let store = MemoryStore::new();
        let first = store.set("/backends/game/g1", "a").unwrap();
        store.set("/elsewhere", "ignored").unwrap();
        store.set("/backends/game/g2", "b").unwrap();

        let mut watch = store.watch("/backends", first - 1).await.unwrap();
        assert_eq!(next_event(&mut watch).await.key, "/backends/game/g1");
        assert_eq!(next_event(&mut watch).await.key, "/backends/game/g2");

        store.delete("/backends/game/g1").unwrap();
        let event = next_event(&mut watch).await;
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.key, "/backends/game/g1");
        assert!(!event.dir);
    }

    #[tokio::test]
    async fn test_watch_from_head_sees_only_new_events() {
        let store = MemoryStore::new();
        store.set("/backends/game/g1", "a").unwrap();
        let head = store.current_index();

        let mut watch = store.watch("/backends", head).await.unwrap();
        store.delete_dir("/backends/game").unwrap();
        let event = next_event(&mut watch).await;
        assert_eq!(event.key, "/backends/game");
        assert!(event.dir);
        assert_eq!(event.index, head + 1);
    }

    #[tokio::test]
    async fn test_watch_behind_history_is_cleared() {
        let store = MemoryStore::with_history_limit(2);
        for i in 0..5 {
            store.set(&format!("/k/{i}"), "v").unwrap();
        }
        let err = store.watch("/k", 1).await.err().unwrap();
        assert_eq!(err, DiscoveryError::IndexCleared { requested: 2, oldest: 4 });
        assert!(store.watch("/k", 3).await.is_ok());
    }
}

//! The service pool: live connections to every known backend instance.
//!
//! # Membership
//!
//! The pool mirrors `root/serviceName/instanceId -> address` entries of a
//! [`CoordinationStore`]. It bulk loads the tree once, then follows a single
//! watch on `root` that starts strictly after the index of that load, so no
//! change between the two is lost. Every accepted entry is dialed before the
//! pool lock is taken; a failed dial leaves the instance out.
//!
//! # Selection
//!
//! Each group keeps its instances in discovery order plus a cursor advanced
//! by atomic fetch-and-add, so selection only needs the shared lock.

use crate::config::DiscoveryConfig;
use crate::dialer::Dialer;
use crate::error::DiscoveryError;
use crate::store::{is_below, normalize_key, CoordinationStore, WatchEvent};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

struct Instance<C> {
    key: String,
    address: String,
    connection: C,
}

struct ServiceGroup<C> {
    instances: Vec<Instance<C>>,
    cursor: AtomicU32,
}

impl<C> Default for ServiceGroup<C> {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            cursor: AtomicU32::new(0),
        }
    }
}

/// A callback channel. Additions seen while its snapshot is still being
/// replayed wait in `pending` so they never overtake the replay.
struct Subscriber {
    id: u64,
    sender: mpsc::Sender<String>,
    pending: Option<Vec<String>>,
}

impl Subscriber {
    /// Returns false once the receiving side is gone.
    fn notify(&mut self, name: &str, key: &str) -> bool {
        if self.sender.is_closed() {
            return false;
        }
        if let Some(pending) = &mut self.pending {
            pending.push(key.to_string());
            return true;
        }
        match self.sender.try_send(key.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("callback for {} is full, dropping {}", name, key);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct PoolState<C> {
    groups: HashMap<String, ServiceGroup<C>>,
    callbacks: HashMap<String, Vec<Subscriber>>,
    next_subscriber: u64,
}

struct PoolInner<D: Dialer> {
    root: String,
    retry_delay: Duration,
    store: Arc<dyn CoordinationStore>,
    dialer: D,
    known_names: HashSet<String>,
    state: RwLock<PoolState<D::Connection>>,
}

/// Process-wide directory of backend service groups.
///
/// Dropping the pool stops the watch, as does [`ServicePool::shutdown`].
pub struct ServicePool<D: Dialer> {
    inner: Arc<PoolInner<D>>,
    shutdown: CancellationToken,
    _stop_on_drop: DropGuard,
}

impl<D: Dialer> ServicePool<D> {
    /// Loads current membership and starts following the store.
    ///
    /// Never fails: an unreadable names file means every service name is
    /// accepted, and an unreadable root means the pool starts empty and
    /// keeps retrying in the background.
    pub async fn start(store: Arc<dyn CoordinationStore>, dialer: D, config: DiscoveryConfig) -> Self {
        let names = if config.names.is_empty() {
            load_names(store.as_ref(), &config.names_path).await
        } else {
            config.names.clone()
        };
        let known_names: HashSet<String> = names
            .iter()
            .map(|name| name.trim().trim_matches('/'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        info!("all service names: {:?}", known_names);

        let inner = Arc::new(PoolInner {
            root: normalize_key(&config.root),
            retry_delay: config.watch_retry_delay(),
            store,
            dialer,
            known_names,
            state: RwLock::new(PoolState {
                groups: HashMap::new(),
                callbacks: HashMap::new(),
                next_subscriber: 0,
            }),
        });

        info!("connecting services under: {}", inner.root);
        let index = inner.resync().await;
        info!("services add complete");

        let shutdown = CancellationToken::new();
        tokio::spawn(watch_loop(inner.clone(), index, shutdown.clone()));

        Self {
            inner,
            _stop_on_drop: shutdown.clone().drop_guard(),
            shutdown,
        }
    }

    /// Picks the next instance of `name` in round-robin order.
    pub fn get_service(&self, name: &str) -> Option<D::Connection> {
        self.get_service_with_key(name).map(|(connection, _)| connection)
    }

    /// Like [`ServicePool::get_service`], also returning the instance key.
    pub fn get_service_with_key(&self, name: &str) -> Option<(D::Connection, String)> {
        let state = self.inner.read();
        let group = state.groups.get(name)?;
        if group.instances.is_empty() {
            return None;
        }
        let idx = group.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as usize
            % group.instances.len();
        let instance = &group.instances[idx];
        Some((instance.connection.clone(), instance.key.clone()))
    }

    /// Returns the instance stored at `root/name/id`, e.g. name `snowflake`
    /// and id `s1` under `/backends` is `/backends/snowflake/s1`.
    pub fn get_service_with_id(&self, name: &str, id: &str) -> Option<D::Connection> {
        let full_key = normalize_key(&format!("{}/{}/{}", self.inner.root, name, id));
        let state = self.inner.read();
        state
            .groups
            .get(name)?
            .instances
            .iter()
            .find(|instance| instance.key == full_key)
            .map(|instance| instance.connection.clone())
    }

    /// Subscribes `sender` to instance additions for `name`.
    ///
    /// Keys already present are replayed first, followed by anything added
    /// while the replay was in progress. After that, additions are
    /// delivered without blocking and dropped for this subscriber when its
    /// buffer is full.
    pub async fn register_callback(&self, name: &str, sender: mpsc::Sender<String>) {
        let (id, mut backlog) = {
            let mut state = self.inner.write();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state
                .callbacks
                .entry(name.to_string())
                .or_default()
                .push(Subscriber {
                    id,
                    sender: sender.clone(),
                    pending: Some(Vec::new()),
                });
            let existing: Vec<String> = state
                .groups
                .get(name)
                .map(|group| group.instances.iter().map(|i| i.key.clone()).collect())
                .unwrap_or_default();
            (id, existing)
        };
        info!("register callback on: {}", name);

        loop {
            for key in backlog {
                if sender.send(key).await.is_err() {
                    self.inner.drop_subscriber(name, id);
                    return;
                }
            }
            let caught_up = {
                let mut state = self.inner.write();
                let Some(subscriber) = state
                    .callbacks
                    .get_mut(name)
                    .and_then(|subscribers| subscribers.iter_mut().find(|s| s.id == id))
                else {
                    return;
                };
                match subscriber.pending.as_mut() {
                    Some(pending) if !pending.is_empty() => Some(std::mem::take(pending)),
                    _ => {
                        subscriber.pending = None;
                        None
                    }
                }
            };
            match caught_up {
                Some(more) => backlog = more,
                None => return,
            }
        }
    }

    /// Names of all groups that currently have instances, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let state = self.inner.read();
        let mut names: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, group)| !group.instances.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Instance keys of `name` in selection order.
    pub fn instance_keys(&self, name: &str) -> Vec<String> {
        let state = self.inner.read();
        state
            .groups
            .get(name)
            .map(|group| group.instances.iter().map(|i| i.key.clone()).collect())
            .unwrap_or_default()
    }

    /// The accepted service names, sorted. Empty means all are accepted.
    pub fn known_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.known_names.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    /// Stops following the store. Current membership keeps being served.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn load_names(store: &dyn CoordinationStore, names_path: &str) -> Vec<String> {
    info!("reading names: {}", names_path);
    match store.get(names_path, false).await {
        Ok(snapshot) if snapshot.node.dir => {
            warn!("names is not a file: {}", names_path);
            Vec::new()
        }
        Ok(snapshot) => snapshot.node.value.lines().map(str::to_string).collect(),
        Err(e) => {
            warn!("could not read names: {}", e);
            Vec::new()
        }
    }
}

async fn watch_loop<D: Dialer>(
    inner: Arc<PoolInner<D>>,
    mut index: Option<u64>,
    shutdown: CancellationToken,
) {
    loop {
        if index.is_none() {
            index = tokio::select! {
                resynced = inner.resync() => resynced,
                _ = shutdown.cancelled() => break,
            };
        }
        tokio::select! {
            _ = inner.follow(&mut index) => {}
            _ = shutdown.cancelled() => break,
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.retry_delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("stopped watching {}", inner.root);
}

impl<D: Dialer> PoolInner<D> {
    fn read(&self) -> RwLockReadGuard<'_, PoolState<D::Connection>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState<D::Connection>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Service name of an instance key, relative to root.
    ///
    /// `None` for keys outside root and for values directly under root,
    /// such as the names file.
    fn service_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        if !is_below(key, &self.root) {
            return None;
        }
        let relative = if self.root == "/" {
            &key[1..]
        } else {
            &key[self.root.len() + 1..]
        };
        relative.rsplit_once('/').map(|(name, _)| name)
    }

    fn accepts(&self, name: &str) -> bool {
        self.known_names.is_empty() || self.known_names.contains(name)
    }

    /// Follows the store from `index` until the watch breaks.
    ///
    /// Advances `index` past every applied event. Resets it to `None` when
    /// the store no longer holds the events needed to continue, which forces
    /// a full resync.
    async fn follow(&self, index: &mut Option<u64>) {
        let Some(after) = *index else {
            return;
        };
        let mut events = match self.store.watch(&self.root, after).await {
            Ok(events) => events,
            Err(e) => {
                self.watch_failed(index, e);
                return;
            }
        };
        debug!("watching {} after index {}", self.root, after);

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    *index = Some(index.map_or(event.index, |seen| seen.max(event.index)));
                    self.apply(event).await;
                }
                Err(e) => {
                    self.watch_failed(index, e);
                    return;
                }
            }
        }
        warn!("watch on {} closed", self.root);
    }

    fn watch_failed(&self, index: &mut Option<u64>, error: DiscoveryError) {
        if matches!(error, DiscoveryError::IndexCleared { .. }) {
            warn!("watch on {} fell behind ({}), resyncing", self.root, error);
            *index = None;
        } else {
            warn!("watch on {} failed: {}", self.root, error);
        }
    }

    async fn apply(&self, event: WatchEvent) {
        trace!("watch event {} {} @{}", event.action, event.key, event.index);
        if event.dir {
            if event.action.is_removal() {
                self.remove_directory(&event.key);
            }
            return;
        }
        if event.action.is_put() {
            self.add_instance(&event.key, &event.value).await;
        } else if event.action.is_removal() {
            self.remove_instance(&event.key);
        }
    }

    /// Rebuilds membership from a full read of root.
    ///
    /// Instances whose key and address are unchanged keep their connection.
    /// Returns the index the read was taken at, `None` if the store could
    /// not be read at all.
    async fn resync(&self) -> Option<u64> {
        let (index, desired) = match self.store.get(&self.root, true).await {
            Ok(snapshot) => {
                let desired: Vec<(String, String)> = snapshot
                    .node
                    .leaves()
                    .into_iter()
                    .filter(|leaf| self.service_name(&leaf.key).is_some_and(|name| self.accepts(name)))
                    .map(|leaf| (leaf.key.clone(), leaf.value.clone()))
                    .collect();
                (snapshot.index, desired)
            }
            Err(DiscoveryError::KeyNotFound { key, index }) => {
                warn!("{} does not exist yet, starting empty", key);
                (index, Vec::new())
            }
            Err(e) => {
                warn!("failed to list services under {}: {}", self.root, e);
                return None;
            }
        };

        let present: HashSet<String> = {
            let wanted: HashMap<&str, &str> = desired
                .iter()
                .map(|(key, address)| (key.as_str(), address.as_str()))
                .collect();
            let mut present = HashSet::new();
            let mut state = self.write();
            for group in state.groups.values_mut() {
                group.instances.retain(|instance| {
                    let keep = wanted.get(instance.key.as_str()) == Some(&instance.address.as_str());
                    if keep {
                        present.insert(instance.key.clone());
                    } else {
                        info!("service removed: {}", instance.key);
                    }
                    keep
                });
            }
            present
        };

        for (key, address) in desired.into_iter().filter(|(key, _)| !present.contains(key)) {
            self.add_instance(&key, &address).await;
        }
        Some(index)
    }

    async fn add_instance(&self, key: &str, address: &str) {
        let Some(name) = self.service_name(key) else {
            trace!("ignoring {}, not an instance key", key);
            return;
        };
        if !self.accepts(name) {
            debug!("ignoring {}, unknown service {}", key, name);
            return;
        }

        let connection = match self.dialer.dial(address).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("did not connect: {} --> {}: {}", key, address, e);
                return;
            }
        };

        let mut guard = self.write();
        let state = &mut *guard;
        let group = state.groups.entry(name.to_string()).or_default();
        if let Some(existing) = group.instances.iter_mut().find(|i| i.key == key) {
            existing.address = address.to_string();
            existing.connection = connection;
            info!("service replaced: {} --> {}", key, address);
            return;
        }

        group.instances.push(Instance {
            key: key.to_string(),
            address: address.to_string(),
            connection,
        });
        info!("service added: {} --> {}", key, address);

        if let Some(subscribers) = state.callbacks.get_mut(name) {
            subscribers.retain_mut(|subscriber| subscriber.notify(name, key));
        }
    }

    fn drop_subscriber(&self, name: &str, id: u64) {
        if let Some(subscribers) = self.write().callbacks.get_mut(name) {
            subscribers.retain(|subscriber| subscriber.id != id);
        }
    }

    fn remove_instance(&self, key: &str) {
        let Some(name) = self.service_name(key) else {
            return;
        };
        if !self.accepts(name) {
            return;
        }

        let mut state = self.write();
        let Some(group) = state.groups.get_mut(name) else {
            debug!("no such service: {}", name);
            return;
        };
        if let Some(position) = group.instances.iter().position(|i| i.key == key) {
            group.instances.remove(position);
            info!("service removed: {}", key);
        }
    }

    /// Drops every group at or below a deleted directory.
    fn remove_directory(&self, key: &str) {
        let mut state = self.write();
        if key == self.root || is_below(&self.root, key) {
            state.groups.clear();
            info!("all services removed with {}", key);
            return;
        }
        if !is_below(key, &self.root) {
            return;
        }
        let relative = if self.root == "/" {
            &key[1..]
        } else {
            &key[self.root.len() + 1..]
        };
        let nested = format!("{relative}/");
        state.groups.retain(|name, _| {
            let doomed = name == relative || name.starts_with(&nested);
            if doomed {
                info!("service group removed: {}", name);
            }
            !doomed
        });
    }
}

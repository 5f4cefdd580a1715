//! In-process Ephemeral Registry.
//!
//! A `RegistryHub` holds the shared namespaces. Each `MemoryRegistry`
//! handle models one physical connection: it owns its disconnect-bindings
//! and its subscriptions, and `disconnect()` (or dropping the handle)
//! fires the bindings and ends the subscriptions in one step.

use async_trait::async_trait;
use easel_core::CollabError;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::{Connectivity, DisconnectAction, EphemeralRegistry, RegistrySnapshot};
use crate::feed::{Feed, Subscription};

type BindingKey = (String, String);

#[derive(Default)]
struct HubState {
    namespaces: HashMap<String, RegistrySnapshot>,
    /// Per-namespace subscriber feeds, tagged with the owning connection.
    watchers: HashMap<String, Vec<(u64, Feed<RegistrySnapshot>)>>,
    bindings: HashMap<u64, BTreeMap<BindingKey, DisconnectAction>>,
    live: HashSet<u64>,
    writes: HashMap<String, u64>,
}

impl HubState {
    fn apply(&mut self, namespace: &str, key: &str, value: Option<Vec<u8>>) {
        let entries = self.namespaces.entry(namespace.to_string()).or_default();
        match value {
            Some(v) => {
                entries.insert(key.to_string(), v);
            }
            None => {
                entries.remove(key);
            }
        }
        *self.writes.entry(namespace.to_string()).or_default() += 1;
    }

    fn publish(&mut self, namespace: &str) {
        let snapshot = self.namespaces.get(namespace).cloned().unwrap_or_default();
        if let Some(watchers) = self.watchers.get_mut(namespace) {
            watchers.retain(|(_, feed)| feed.subscriber_count() > 0);
            for (_, feed) in watchers.iter() {
                feed.publish(snapshot.clone());
            }
        }
    }

    /// Fire `conn`'s bindings and close its feeds. Returns the number of
    /// bindings applied.
    fn drop_connection(&mut self, conn: u64) -> usize {
        if !self.live.remove(&conn) {
            return 0;
        }
        let bindings = self.bindings.remove(&conn).unwrap_or_default();
        let fired = bindings.len();
        let mut touched = HashSet::new();
        for ((namespace, key), action) in bindings {
            let value = match action {
                DisconnectAction::Remove => None,
                DisconnectAction::Set(v) => Some(v),
            };
            self.apply(&namespace, &key, value);
            touched.insert(namespace);
        }

        for watchers in self.watchers.values_mut() {
            watchers.retain(|(owner, feed)| {
                if *owner == conn {
                    feed.close();
                    false
                } else {
                    true
                }
            });
        }
        for namespace in touched {
            self.publish(&namespace);
        }
        fired
    }
}

struct HubShared {
    state: Mutex<HubState>,
    next_conn: AtomicU64,
    feed_capacity: usize,
}

impl HubShared {
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self) -> u64 {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.state().live.insert(conn);
        conn
    }
}

/// Shared namespaces for every in-process connection.
#[derive(Clone)]
pub struct RegistryHub {
    shared: Arc<HubShared>,
}

impl RegistryHub {
    pub fn new(feed_capacity: usize) -> Self {
        Self {
            shared: Arc::new(HubShared {
                state: Mutex::new(HubState::default()),
                next_conn: AtomicU64::new(1),
                feed_capacity,
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryRegistry {
        let conn = self.shared.open();
        debug!("Registry connection {} opened", conn);
        MemoryRegistry {
            shared: self.shared.clone(),
            conn: AtomicU64::new(conn),
            connected: watch::Sender::new(Connectivity::up(conn)),
        }
    }

    /// Current contents of `namespace`.
    pub fn snapshot(&self, namespace: &str) -> RegistrySnapshot {
        self.shared.state().namespaces.get(namespace).cloned().unwrap_or_default()
    }

    /// Total writes applied to `namespace`, bindings included.
    pub fn write_count(&self, namespace: &str) -> u64 {
        self.shared.state().writes.get(namespace).copied().unwrap_or(0)
    }

    pub fn live_connections(&self) -> usize {
        self.shared.state().live.len()
    }
}

impl Default for RegistryHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One connection to a `RegistryHub`.
pub struct MemoryRegistry {
    shared: Arc<HubShared>,
    conn: AtomicU64,
    connected: watch::Sender<Connectivity>,
}

impl MemoryRegistry {
    /// Drop the connection: fire every binding armed on it, end its
    /// subscriptions and report `false` on the connectivity signal.
    pub fn disconnect(&self) {
        let conn = self.conn.load(Ordering::SeqCst);
        let fired = self.shared.state().drop_connection(conn);
        if fired > 0 || self.is_connected() {
            info!("Registry connection {} dropped, fired {} bindings", conn, fired);
        }
        self.connected.send_modify(|c| *c = c.down());
    }

    /// Replace the connection with a fresh one. The new connection carries
    /// no bindings and no subscriptions.
    pub fn reconnect(&self) {
        self.disconnect();
        let conn = self.shared.open();
        self.conn.store(conn, Ordering::SeqCst);
        debug!("Registry connection {} opened", conn);
        self.connected.send_replace(Connectivity::up(conn));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.borrow().connected
    }

    /// Bindings currently armed on this connection.
    pub fn binding_count(&self) -> usize {
        let conn = self.conn.load(Ordering::SeqCst);
        self.shared.state().bindings.get(&conn).map(|b| b.len()).unwrap_or(0)
    }

    fn live_state(&self) -> Result<(u64, MutexGuard<'_, HubState>), CollabError> {
        let conn = self.conn.load(Ordering::SeqCst);
        let state = self.shared.state();
        if !state.live.contains(&conn) {
            return Err(CollabError::StoreUnavailable("registry connection closed".into()));
        }
        Ok((conn, state))
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        let conn = self.conn.load(Ordering::SeqCst);
        self.shared.state().drop_connection(conn);
    }
}

#[async_trait]
impl EphemeralRegistry for MemoryRegistry {
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), CollabError> {
        let (_, mut state) = self.live_state()?;
        state.apply(namespace, key, Some(value));
        state.publish(namespace);
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), CollabError> {
        let (_, mut state) = self.live_state()?;
        state.apply(namespace, key, None);
        state.publish(namespace);
        Ok(())
    }

    async fn on_disconnect(
        &self,
        namespace: &str,
        key: &str,
        action: DisconnectAction,
    ) -> Result<(), CollabError> {
        let (conn, mut state) = self.live_state()?;
        state
            .bindings
            .entry(conn)
            .or_default()
            .insert((namespace.to_string(), key.to_string()), action);
        Ok(())
    }

    async fn cancel_on_disconnect(&self, namespace: &str, key: &str) -> Result<(), CollabError> {
        let (conn, mut state) = self.live_state()?;
        if let Some(bindings) = state.bindings.get_mut(&conn) {
            bindings.remove(&(namespace.to_string(), key.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, namespace: &str) -> Result<Subscription<RegistrySnapshot>, CollabError> {
        let capacity = self.shared.feed_capacity;
        let (conn, mut state) = self.live_state()?;
        let current = state.namespaces.get(namespace).cloned().unwrap_or_default();
        let feed = Feed::with_value(capacity, current);
        let subscription = feed.subscribe();
        state
            .watchers
            .entry(namespace.to_string())
            .or_default()
            .push((conn, feed));
        Ok(subscription)
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connected.subscribe()
    }
}

//! Ephemeral Registry: connection-scoped key/value namespaces with
//! disconnect-bound writes.
//!
//! Presence and cursors live here. The one capability everything else leans
//! on is `on_disconnect`: "when this connection drops, atomically apply this
//! write", executed by the registry itself and not by application code.
//!
//! - [`memory`]: in-process hub; each handle is one simulated connection
//! - [`server`] / [`client`]: WebSocket registry shared between processes
//! - [`protocol`]: bincode wire messages

pub mod client;
pub mod memory;
pub mod protocol;
pub mod server;

pub use client::{ClientConfig, RegistryClient};
pub use memory::{MemoryRegistry, RegistryHub};
pub use protocol::{ProtocolError, RegistryMessage};
pub use server::{RegistryServer, ServerConfig, ServerStats};

use async_trait::async_trait;
use easel_core::CollabError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::feed::Subscription;

/// Every entry of one namespace, keyed by entry key.
pub type RegistrySnapshot = BTreeMap<String, Vec<u8>>;

/// Connectivity signal. `epoch` identifies the physical connection, so a
/// drop followed by a quick reconnect is visible even if an observer only
/// sees the final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Connectivity {
    pub connected: bool,
    pub epoch: u64,
}

impl Connectivity {
    pub fn up(epoch: u64) -> Self {
        Self { connected: true, epoch }
    }

    pub fn down(self) -> Self {
        Self { connected: false, ..self }
    }
}

/// Write applied by the registry when the binding connection drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectAction {
    Remove,
    Set(Vec<u8>),
}

/// One connection to an Ephemeral Registry.
#[async_trait]
pub trait EphemeralRegistry: Send + Sync {
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), CollabError>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), CollabError>;

    /// Arm a binding on this connection. Re-arming the same key replaces
    /// the previous action.
    async fn on_disconnect(
        &self,
        namespace: &str,
        key: &str,
        action: DisconnectAction,
    ) -> Result<(), CollabError>;

    async fn cancel_on_disconnect(&self, namespace: &str, key: &str) -> Result<(), CollabError>;

    /// Snapshots of `namespace`, starting with the current one. The
    /// subscription ends when this connection drops; callers resubscribe
    /// after reconnecting.
    async fn subscribe(&self, namespace: &str) -> Result<Subscription<RegistrySnapshot>, CollabError>;

    fn connectivity(&self) -> watch::Receiver<Connectivity>;
}

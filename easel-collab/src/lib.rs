//! # easel-collab: Collaboration-consistency layer for Easel
//!
//! Keeps many concurrent sessions on one shared canvas consistent: one
//! writer per shape, live presence and cursors, and automatic lock recovery
//! when a session vanishes.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌────────────────┐
//!   UI events ─────► │ CollabSession  │ ─────► SessionEvent stream
//!                    └───────┬────────┘
//!          ┌─────────────────┼──────────────────┐
//!          ▼                 ▼                  ▼
//!   LockCoordinator   PresenceTracker    CursorBroadcaster
//!   ShapeStore               │                  │
//!          │                 └────────┬─────────┘
//!          ▼                          ▼
//!   dyn ShapeBackend         dyn EphemeralRegistry ◄── ConnectionMonitor
//!   (Memory / RocksDB)       (Memory / WebSocket)
//! ```
//!
//! ## Modules
//!
//! - [`feed`]: Latest-value fan-out behind every subscription
//! - [`store`]: Shape persistence, backends and the lock-gated `ShapeStore`
//! - [`lock`]: Per-shape mutual exclusion and departure recovery
//! - [`registry`]: Ephemeral Registry with disconnect-bound writes
//! - [`presence`]: Liveness records and departure diffs
//! - [`cursor`]: Throttled cursor broadcast
//! - [`connection`]: Connectivity transitions that trigger re-arming
//! - [`undo`]: Bounded undo/redo history
//! - [`session`]: Per-session facade and reactive loop
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Single writer per shape | Lock check inside the backend's atomic read-modify-write |
//! | Departure recovery | Presence diff → `force_release_all` in one transaction |
//! | No stale cursors | Disconnect-bound removal, re-armed after reconnect |
//! | Atomic clear | `remove_all` publishes one snapshot |

pub mod config;
pub mod connection;
pub mod cursor;
pub mod feed;
pub mod identity;
pub mod lock;
pub mod presence;
pub mod registry;
pub mod session;
pub mod store;
pub mod undo;

// Re-exports for convenience
pub use config::CollabConfig;
pub use connection::{ConnectionEvent, ConnectionMonitor};
pub use cursor::{CursorBroadcaster, CursorRecord, RemoteCursor, CURSOR_NAMESPACE};
pub use feed::{Feed, FeedStats, Subscription};
pub use identity::{Identity, SessionUser};
pub use lock::LockCoordinator;
pub use presence::{departures, PresenceRecord, PresenceSet, PresenceTracker, PRESENCE_NAMESPACE};
pub use registry::{
    ClientConfig, Connectivity, DisconnectAction, EphemeralRegistry, MemoryRegistry,
    RegistryClient, RegistryHub, RegistryServer, ServerConfig, ServerStats,
};
pub use session::{CollabSession, SessionEvent, SessionStats};
pub use store::{MemoryBackend, RocksBackend, ShapeBackend, ShapeStore, StoreConfig};
pub use undo::{UndoAction, UndoRedoManager};

pub use easel_core::{CollabError, Shape, ShapeId, ShapeKind, ShapePatch, UserId};

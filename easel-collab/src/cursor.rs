//! Throttled pointer broadcast.
//!
//! Cursor writes are rate-limited per user: the first move in a quiet
//! period is written immediately, moves inside the interval only replace a
//! pending position, and one trailing write flushes the newest position
//! when the interval ends. Intermediate positions are dropped, never queued,
//! and the registry always ends up holding the latest position.
//!
//! ```text
//! move:   x1  x2 x3 x4          x5
//! write:  x1 ─────────► x4      x5
//!         |<-interval->|
//! ```

use easel_core::{now_millis, CollabError, CursorColor, Timestamp, UserId};
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::feed::Subscription;
use crate::registry::{DisconnectAction, EphemeralRegistry, RegistrySnapshot};

pub const CURSOR_NAMESPACE: &str = "cursors";

/// Stored cursor entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub x: f32,
    pub y: f32,
    pub display_name: String,
    pub last_update: Timestamp,
}

impl CursorRecord {
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))?;
        Ok(record)
    }
}

/// Another session's cursor, ready to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub user_id: UserId,
    pub x: f32,
    pub y: f32,
    pub display_name: String,
    pub last_update: Timestamp,
    pub color: CursorColor,
}

/// What to do with a position offered to the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Write immediately.
    WriteNow,
    /// Keep as pending and schedule a trailing write after the delay.
    Schedule(Duration),
    /// Replace the pending position; a trailing write is already scheduled.
    Coalesce,
}

/// Leading + trailing rate limiter. Pure: callers supply the clock.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_write: Option<Instant>,
    flush_scheduled: bool,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_write: None,
            flush_scheduled: false,
        }
    }

    pub fn offer(&mut self, now: Instant) -> ThrottleDecision {
        if self.flush_scheduled {
            return ThrottleDecision::Coalesce;
        }
        match self.last_write {
            Some(last) if now.duration_since(last) < self.interval => {
                self.flush_scheduled = true;
                ThrottleDecision::Schedule(self.interval - now.duration_since(last))
            }
            _ => {
                self.last_write = Some(now);
                ThrottleDecision::WriteNow
            }
        }
    }

    /// Record that the trailing write happened.
    pub fn flushed(&mut self, now: Instant) {
        self.flush_scheduled = false;
        self.last_write = Some(now);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

struct CursorSlot {
    throttle: Throttle,
    pending: Option<CursorRecord>,
}

struct BroadcasterShared {
    registry: Arc<dyn EphemeralRegistry>,
    interval: Duration,
    slots: Mutex<HashMap<UserId, CursorSlot>>,
    writes: AtomicU64,
    failures: AtomicU64,
}

impl BroadcasterShared {
    fn slots(&self) -> MutexGuard<'_, HashMap<UserId, CursorSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best-effort write; failures are logged and counted.
    async fn write(&self, user: &UserId, record: CursorRecord) {
        let result = match record.encode() {
            Ok(bytes) => self.registry.set(CURSOR_NAMESPACE, user.as_str(), bytes).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                trace!("Cursor {} -> ({}, {})", user, record.x, record.y);
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Cursor write for {} failed: {}", user, e);
            }
        }
    }
}

#[derive(Clone)]
pub struct CursorBroadcaster {
    shared: Arc<BroadcasterShared>,
}

impl CursorBroadcaster {
    pub fn new(registry: Arc<dyn EphemeralRegistry>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(BroadcasterShared {
                registry,
                interval,
                slots: Mutex::new(HashMap::new()),
                writes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a pointer position. Never fails; see module docs for the
    /// throttling rules.
    pub async fn publish(&self, user: &UserId, display_name: &str, x: f32, y: f32) {
        let record = CursorRecord {
            x,
            y,
            display_name: display_name.to_string(),
            last_update: now_millis(),
        };

        let decision = {
            let mut slots = self.shared.slots();
            let slot = slots.entry(user.clone()).or_insert_with(|| CursorSlot {
                throttle: Throttle::new(self.shared.interval),
                pending: None,
            });
            let decision = slot.throttle.offer(Instant::now());
            if decision != ThrottleDecision::WriteNow {
                slot.pending = Some(record.clone());
            }
            decision
        };

        match decision {
            ThrottleDecision::WriteNow => self.shared.write(user, record).await,
            ThrottleDecision::Schedule(delay) => {
                let shared = self.shared.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let pending = {
                        let mut slots = shared.slots();
                        let pending = slots.get_mut(&user).and_then(|slot| {
                            slot.throttle.flushed(Instant::now());
                            slot.pending.take()
                        });
                        pending
                    };
                    if let Some(record) = pending {
                        shared.write(&user, record).await;
                    }
                });
            }
            ThrottleDecision::Coalesce => trace!("Cursor {} coalesced", user),
        }
    }

    /// Arm removal of `user`'s cursor when this connection drops. Must be
    /// re-run after every reconnect.
    pub async fn arm_disconnect(&self, user: &UserId) -> Result<(), CollabError> {
        self.shared
            .registry
            .on_disconnect(CURSOR_NAMESPACE, user.as_str(), DisconnectAction::Remove)
            .await
    }

    /// Cancel the binding, drop any pending trailing write and remove the
    /// stored cursor.
    pub async fn remove(&self, user: &UserId) -> Result<(), CollabError> {
        {
            let mut slots = self.shared.slots();
            if let Some(slot) = slots.get_mut(user) {
                slot.pending = None;
            }
        }
        self.shared.registry.cancel_on_disconnect(CURSOR_NAMESPACE, user.as_str()).await?;
        self.shared.registry.remove(CURSOR_NAMESPACE, user.as_str()).await
    }

    /// Everyone else's cursors. `viewer`'s own entry is filtered out here so
    /// callers never see it.
    pub async fn subscribe(&self, viewer: &UserId) -> Result<CursorSubscription, CollabError> {
        let inner = self.shared.registry.subscribe(CURSOR_NAMESPACE).await?;
        Ok(CursorSubscription {
            inner,
            viewer: viewer.clone(),
        })
    }

    /// Successful registry writes so far.
    pub fn writes(&self) -> u64 {
        self.shared.writes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }
}

pub struct CursorSubscription {
    inner: Subscription<RegistrySnapshot>,
    viewer: UserId,
}

impl CursorSubscription {
    /// Other sessions' cursors ordered by user id; `None` once the registry
    /// connection drops.
    pub async fn next(&mut self) -> Option<Vec<RemoteCursor>> {
        let snapshot = self.inner.next().await?;
        Some(remote_cursors(&snapshot, &self.viewer))
    }
}

pub fn remote_cursors(snapshot: &RegistrySnapshot, viewer: &UserId) -> Vec<RemoteCursor> {
    snapshot
        .iter()
        .filter(|(key, _)| key.as_str() != viewer.as_str())
        .filter_map(|(key, bytes)| match CursorRecord::decode(bytes) {
            Ok(record) => {
                let user_id = UserId::new(key.clone());
                Some(RemoteCursor {
                    color: CursorColor::for_user(&user_id),
                    user_id,
                    x: record.x,
                    y: record.y,
                    display_name: record.display_name,
                    last_update: record.last_update,
                })
            }
            Err(e) => {
                warn!("Skipping malformed cursor for {}: {}", key, e);
                None
            }
        })
        .collect()
}

//! Liveness records and departure detection.
//!
//! A session is "present" while its record exists in the `presence`
//! namespace of the Ephemeral Registry. The record is removed by the
//! registry's disconnect-binding when the connection drops, never by the
//! departing session. Observers diff successive presence sets to find
//! departures and trigger lock recovery.

use easel_core::{now_millis, CollabError, CursorColor, Timestamp, UserId};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::feed::Subscription;
use crate::registry::{DisconnectAction, EphemeralRegistry, RegistrySnapshot};

pub const PRESENCE_NAMESPACE: &str = "presence";

/// Stored presence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub display_name: String,
    pub last_seen: Timestamp,
}

impl PresenceRecord {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            last_seen: now_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Codec(e.to_string()))?;
        Ok(record)
    }

    /// Badge color, derived from the key and never stored.
    pub fn color(user: &UserId) -> CursorColor {
        CursorColor::for_user(user)
    }
}

/// Everyone currently present, keyed by user.
pub type PresenceSet = BTreeMap<UserId, PresenceRecord>;

/// Users present in `prev` and absent from `next`.
pub fn departures(prev: &PresenceSet, next: &PresenceSet) -> Vec<UserId> {
    prev.keys().filter(|user| !next.contains_key(*user)).cloned().collect()
}

/// Users present in `next` and absent from `prev`.
pub fn arrivals(prev: &PresenceSet, next: &PresenceSet) -> Vec<UserId> {
    next.keys().filter(|user| !prev.contains_key(*user)).cloned().collect()
}

#[derive(Clone)]
pub struct PresenceTracker {
    registry: Arc<dyn EphemeralRegistry>,
}

impl PresenceTracker {
    pub fn new(registry: Arc<dyn EphemeralRegistry>) -> Self {
        Self { registry }
    }

    /// Arm the removal binding, then write the record. The record is never
    /// visible without a binding behind it.
    pub async fn join(&self, user: &UserId, display_name: &str) -> Result<(), CollabError> {
        self.registry
            .on_disconnect(PRESENCE_NAMESPACE, user.as_str(), DisconnectAction::Remove)
            .await?;
        let record = PresenceRecord::new(display_name);
        self.registry
            .set(PRESENCE_NAMESPACE, user.as_str(), record.encode()?)
            .await?;
        info!("{} ({}) joined", display_name, user);
        Ok(())
    }

    /// Graceful logout. Cancels the binding and removes the record.
    pub async fn leave(&self, user: &UserId) -> Result<(), CollabError> {
        self.registry.cancel_on_disconnect(PRESENCE_NAMESPACE, user.as_str()).await?;
        self.registry.remove(PRESENCE_NAMESPACE, user.as_str()).await?;
        info!("{} left", user);
        Ok(())
    }

    pub async fn subscribe(&self) -> Result<PresenceSubscription, CollabError> {
        let inner = self.registry.subscribe(PRESENCE_NAMESPACE).await?;
        Ok(PresenceSubscription { inner })
    }
}

/// Decoded presence sets. Ends when the registry connection drops.
pub struct PresenceSubscription {
    inner: Subscription<RegistrySnapshot>,
}

impl PresenceSubscription {
    pub async fn next(&mut self) -> Option<PresenceSet> {
        let snapshot = self.inner.next().await?;
        Some(decode_presence(&snapshot))
    }
}

/// Undecodable entries are skipped, not fatal.
pub fn decode_presence(snapshot: &RegistrySnapshot) -> PresenceSet {
    snapshot
        .iter()
        .filter_map(|(key, bytes)| match PresenceRecord::decode(bytes) {
            Ok(record) => Some((UserId::new(key.clone()), record)),
            Err(e) => {
                warn!("Skipping malformed presence record for {}: {}", key, e);
                None
            }
        })
        .inspect(|(user, _)| debug!("Present: {}", user))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryHub;

    fn set_of(users: &[&str]) -> PresenceSet {
        users
            .iter()
            .map(|u| (UserId::from(*u), PresenceRecord::new(*u)))
            .collect()
    }

    // ── Diff helpers ─────────────────────────────────────────────

    #[test]
    fn test_departures_and_arrivals() {
        let prev = set_of(&["a", "b", "c"]);
        let next = set_of(&["b", "d"]);
        assert_eq!(departures(&prev, &next), vec![UserId::from("a"), UserId::from("c")]);
        assert_eq!(arrivals(&prev, &next), vec![UserId::from("d")]);
        assert!(departures(&next, &next).is_empty());
    }

    #[test]
    fn test_record_roundtrip_and_color() {
        let record = PresenceRecord::new("Alice");
        let decoded = PresenceRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        let user = UserId::from("alice");
        assert_eq!(PresenceRecord::color(&user), CursorColor::for_user(&user));
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let mut snapshot = RegistrySnapshot::new();
        snapshot.insert("good".into(), PresenceRecord::new("Good").encode().unwrap());
        snapshot.insert("bad".into(), vec![0xff, 0xff, 0xff]);
        let set = decode_presence(&snapshot);
        assert_eq!(set.len(), 1);
        assert!(set.contains_key(&UserId::from("good")));
    }

    // ── Tracker ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_join_arms_binding_before_write() {
        let hub = RegistryHub::default();
        let conn = Arc::new(hub.connect());
        let tracker = PresenceTracker::new(conn.clone());

        tracker.join(&UserId::from("alice"), "Alice").await.unwrap();
        assert_eq!(conn.binding_count(), 1);
        assert!(hub.snapshot(PRESENCE_NAMESPACE).contains_key("alice"));

        conn.disconnect();
        assert!(hub.snapshot(PRESENCE_NAMESPACE).is_empty());
    }

    #[tokio::test]
    async fn test_leave_removes_record_and_binding() {
        let hub = RegistryHub::default();
        let conn = Arc::new(hub.connect());
        let tracker = PresenceTracker::new(conn.clone());
        let alice = UserId::from("alice");

        tracker.join(&alice, "Alice").await.unwrap();
        tracker.leave(&alice).await.unwrap();
        assert_eq!(conn.binding_count(), 0);
        assert!(hub.snapshot(PRESENCE_NAMESPACE).is_empty());
    }

    #[tokio::test]
    async fn test_subscription_observes_departure() {
        let hub = RegistryHub::default();
        let observer = PresenceTracker::new(Arc::new(hub.connect()));
        let leaver_conn = Arc::new(hub.connect());
        let leaver = PresenceTracker::new(leaver_conn.clone());

        let mut sub = observer.subscribe().await.unwrap();
        let initial = sub.next().await.unwrap();
        assert!(initial.is_empty());

        leaver.join(&UserId::from("bob"), "Bob").await.unwrap();
        let joined = sub.next().await.unwrap();
        assert_eq!(joined.get(&UserId::from("bob")).map(|r| r.display_name.as_str()), Some("Bob"));

        leaver_conn.disconnect();
        let after = sub.next().await.unwrap();
        assert_eq!(departures(&joined, &after), vec![UserId::from("bob")]);
    }
}

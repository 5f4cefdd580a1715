//! Per-shape mutual exclusion.
//!
//! State machine per shape:
//!
//! ```text
//!   Unlocked ──acquire(A)──► Locked(A) ──release(A)──► Unlocked
//!                              │  ▲
//!                              └──┘ acquire(A) refreshes locked_at
//! ```
//!
//! Lock fields live on the shape document. Acquisition runs inside the
//! backend's atomic read-modify-write, so two sessions can never both
//! observe "unlocked" and both win.

use easel_core::{now_millis, CollabError, Shape, ShapeId, ShapeLock, UserId};
use log::{debug, info, warn};
use std::sync::Arc;

use crate::store::ShapeBackend;

#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn ShapeBackend>,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn ShapeBackend>) -> Self {
        Self { backend }
    }

    /// Take (or refresh) the lock for `holder`.
    ///
    /// `Ok(false)` means another session holds the shape. That is an
    /// ordinary outcome, not an error. Missing shapes and backend failures
    /// are surfaced as errors.
    pub async fn acquire(&self, id: ShapeId, holder: &UserId) -> Result<bool, CollabError> {
        let who = holder.clone();
        let result = self
            .backend
            .modify(
                id,
                Box::new(move |shape: &mut Shape| {
                    shape.check_writable(&who)?;
                    shape.lock = Some(ShapeLock {
                        holder: who,
                        locked_at: now_millis(),
                    });
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(_) => {
                debug!("{} locked {}", holder, id);
                Ok(true)
            }
            Err(CollabError::LockConflict { holder: owner, .. }) => {
                debug!("{} lost lock race for {} to {}", holder, id, owner);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Clear the lock if `holder` owns it or nobody does. Never fails:
    /// releasing someone else's lock, a vanished shape and backend errors
    /// are all logged and ignored.
    pub async fn release(&self, id: ShapeId, holder: &UserId) {
        let who = holder.clone();
        let result = self
            .backend
            .modify(
                id,
                Box::new(move |shape: &mut Shape| {
                    shape.check_writable(&who)?;
                    shape.lock = None;
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(_) => debug!("{} released {}", holder, id),
            Err(CollabError::LockConflict { holder: owner, .. }) => {
                warn!("{} tried to release {} held by {}", holder, id, owner);
            }
            Err(CollabError::NotFound(_)) => debug!("Release of vanished shape {}", id),
            Err(e) => warn!("Failed to release {} for {}: {}", id, holder, e),
        }
    }

    /// Attempt every id independently; returns the ones now held by
    /// `holder`. Conflicts and vanished shapes are dropped from the result.
    pub async fn acquire_many(&self, ids: &[ShapeId], holder: &UserId) -> Vec<ShapeId> {
        let mut acquired = Vec::with_capacity(ids.len());
        for id in ids {
            match self.acquire(*id, holder).await {
                Ok(true) => acquired.push(*id),
                Ok(false) => {}
                Err(e) => warn!("Could not lock {} for {}: {}", id, holder, e),
            }
        }
        acquired
    }

    pub async fn release_many(&self, ids: &[ShapeId], holder: &UserId) {
        for id in ids {
            self.release(*id, holder).await;
        }
    }

    /// Clear every lock held by `holder` in one transaction. Used once the
    /// holder's session is known to be gone.
    pub async fn force_release_all(&self, holder: &UserId) -> Result<usize, CollabError> {
        let who = holder.clone();
        let released = self
            .backend
            .modify_all(Box::new(move |shape: &mut Shape| {
                if shape.is_locked_by(&who) {
                    shape.lock = None;
                    true
                } else {
                    false
                }
            }))
            .await?;
        if released > 0 {
            info!("Force-released {} locks held by {}", released, holder);
        }
        Ok(released)
    }

    /// Unconditionally clear every lock. Operator recovery for orphaned
    /// locks the disconnect path missed.
    pub async fn admin_clear_all_locks(&self) -> Result<usize, CollabError> {
        let cleared = self
            .backend
            .modify_all(Box::new(|shape: &mut Shape| shape.lock.take().is_some()))
            .await?;
        warn!("Admin cleared {} locks", cleared);
        Ok(cleared)
    }

    pub async fn holder_of(&self, id: ShapeId) -> Result<Option<UserId>, CollabError> {
        Ok(self
            .backend
            .get(id)
            .await?
            .and_then(|shape| shape.lock.map(|lock| lock.holder)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use easel_core::ShapeKind;

    async fn setup(n: usize) -> (Arc<MemoryBackend>, LockCoordinator, Vec<ShapeId>) {
        let backend = Arc::new(MemoryBackend::default());
        let mut ids = Vec::new();
        for i in 0..n {
            let shape = Shape::create(
                ShapeKind::rectangle(i as f32, 0.0, 10.0, 10.0),
                UserId::from("creator"),
                i as u64,
            )
            .unwrap();
            ids.push(shape.id);
            backend.insert(shape).await.unwrap();
        }
        let locks = LockCoordinator::new(backend.clone());
        (backend, locks, ids)
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let (_, locks, ids) = setup(1).await;
        let (a, b) = (UserId::from("a"), UserId::from("b"));

        assert!(locks.acquire(ids[0], &a).await.unwrap());
        assert!(!locks.acquire(ids[0], &b).await.unwrap());
        assert_eq!(locks.holder_of(ids[0]).await.unwrap(), Some(a.clone()));

        locks.release(ids[0], &a).await;
        assert!(locks.acquire(ids[0], &b).await.unwrap());
        assert_eq!(locks.holder_of(ids[0]).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_succeeds() {
        let (_, locks, ids) = setup(1).await;
        let a = UserId::from("a");
        assert!(locks.acquire(ids[0], &a).await.unwrap());
        assert!(locks.acquire(ids[0], &a).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let (_, locks, ids) = setup(1).await;
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        assert!(locks.acquire(ids[0], &a).await.unwrap());

        locks.release(ids[0], &b).await;
        assert_eq!(locks.holder_of(ids[0]).await.unwrap(), Some(a));

        // Vanished shape and already-unlocked shape are both silent.
        locks.release(ShapeId::new(), &b).await;
        let (_, locks, ids) = setup(1).await;
        locks.release(ids[0], &b).await;
    }

    #[tokio::test]
    async fn test_acquire_missing_shape_errors() {
        let (_, locks, _) = setup(0).await;
        let id = ShapeId::new();
        assert_eq!(locks.acquire(id, &UserId::from("a")).await, Err(CollabError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_acquire_many_partial_success() {
        let (_, locks, ids) = setup(3).await;
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        assert!(locks.acquire(ids[1], &b).await.unwrap());

        let mut wanted = ids.clone();
        wanted.push(ShapeId::new());
        let got = locks.acquire_many(&wanted, &a).await;
        assert_eq!(got, vec![ids[0], ids[2]]);

        locks.release_many(&got, &a).await;
        assert_eq!(locks.holder_of(ids[0]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_force_release_all_only_touches_holder() {
        let (backend, locks, ids) = setup(4).await;
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        locks.acquire(ids[0], &a).await.unwrap();
        locks.acquire(ids[1], &a).await.unwrap();
        locks.acquire(ids[2], &b).await.unwrap();

        assert_eq!(locks.force_release_all(&a).await.unwrap(), 2);
        let holders: Vec<Option<UserId>> = backend
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.locked_by().cloned())
            .collect();
        assert_eq!(holders, vec![None, None, Some(b), None]);
        assert_eq!(locks.force_release_all(&a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_admin_clear_all_locks() {
        let (_, locks, ids) = setup(3).await;
        locks.acquire(ids[0], &UserId::from("a")).await.unwrap();
        locks.acquire(ids[1], &UserId::from("b")).await.unwrap();
        assert_eq!(locks.admin_clear_all_locks().await.unwrap(), 2);
        for id in ids {
            assert_eq!(locks.holder_of(id).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_concurrent_acquirers_single_winner() {
        let (_, locks, ids) = setup(1).await;
        let id = ids[0];
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire(id, &UserId::new(format!("user-{i}"))).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_backend_outage_surfaces_on_acquire_only() {
        let (backend, locks, ids) = setup(1).await;
        backend.set_offline(true);
        assert!(locks.acquire(ids[0], &UserId::from("a")).await.unwrap_err().is_recoverable());
        locks.release(ids[0], &UserId::from("a")).await;
    }
}

//! Shape persistence: the backend seam plus the `ShapeStore` service that
//! applies identity and lock checks on top of it.
//!
//! ```text
//! ShapeStore (caller identity, lock gate)
//!     │
//!     ▼
//! dyn ShapeBackend ──► MemoryBackend (in-process)
//!                  └─► RocksBackend  (durable, LZ4 + bincode)
//! ```
//!
//! Mutation, not acquisition, is the authoritative gate: every update and
//! delete re-checks `lock` against the live document inside the backend's
//! atomic read-modify-write.

pub mod backend;
pub mod memory;
pub mod rocks;

pub use backend::{BulkEdit, ShapeBackend, ShapeChange, ShapeCheck, ShapeEdit};
pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

use easel_core::{now_millis, CollabError, Shape, ShapeId, ShapeKind, ShapePatch};
use log::{debug, info};
use std::sync::Arc;

use crate::feed::Subscription;
use crate::identity::Identity;

/// Shape CRUD on behalf of one session.
#[derive(Clone)]
pub struct ShapeStore {
    backend: Arc<dyn ShapeBackend>,
    identity: Identity,
}

impl ShapeStore {
    pub fn new(backend: Arc<dyn ShapeBackend>, identity: Identity) -> Self {
        Self { backend, identity }
    }

    pub fn backend(&self) -> &Arc<dyn ShapeBackend> {
        &self.backend
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Validate and insert a new, unlocked shape stamped with the caller.
    pub async fn create(&self, kind: ShapeKind) -> Result<ShapeId, CollabError> {
        let user = self.identity.require()?;
        let shape = Shape::create(kind, user.user_id, now_millis())?;
        let id = shape.id;
        debug!("Creating {} {}", shape.kind.name(), id);
        self.backend.insert(shape).await?;
        Ok(id)
    }

    /// Merge `patch` into the live document. Fails with `NotFound` if the
    /// shape is gone and `LockConflict` if another session holds it.
    pub async fn update(&self, id: ShapeId, patch: ShapePatch) -> Result<ShapeChange, CollabError> {
        let user = self.identity.require()?;
        self.backend
            .modify(
                id,
                Box::new(move |shape: &mut Shape| {
                    shape.check_writable(&user.user_id)?;
                    patch.apply(&mut shape.kind)?;
                    shape.updated_at = now_millis();
                    Ok(())
                }),
            )
            .await
    }

    /// Remove the document under the same lock check as `update`.
    pub async fn delete(&self, id: ShapeId) -> Result<Shape, CollabError> {
        let user = self.identity.require()?;
        let removed = self
            .backend
            .remove_if(id, Box::new(move |shape: &Shape| shape.check_writable(&user.user_id)))
            .await?;
        debug!("Deleted shape {}", id);
        Ok(removed)
    }

    /// Re-insert a previously deleted shape with its original id and
    /// creation metadata. Restored shapes come back unlocked.
    pub async fn restore(&self, mut shape: Shape) -> Result<ShapeId, CollabError> {
        self.identity.require()?;
        shape.lock = None;
        shape.updated_at = now_millis();
        let id = shape.id;
        self.backend.insert(shape).await?;
        Ok(id)
    }

    pub async fn get(&self, id: ShapeId) -> Result<Option<Shape>, CollabError> {
        self.backend.get(id).await
    }

    /// All shapes, `created_at` ascending.
    pub async fn list(&self) -> Result<Vec<Shape>, CollabError> {
        self.backend.list().await
    }

    /// Full ordered list on every committed mutation, from any session.
    pub fn subscribe(&self) -> Subscription<Vec<Shape>> {
        self.backend.subscribe()
    }

    /// Administrative wipe in one transaction. Subscribers see the full list
    /// and then the empty list, never a partial subset.
    pub async fn clear_all(&self) -> Result<usize, CollabError> {
        let user = self.identity.require()?;
        let removed = self.backend.remove_all().await?;
        info!("{} cleared {} shapes", user.user_id, removed);
        Ok(removed)
    }
}

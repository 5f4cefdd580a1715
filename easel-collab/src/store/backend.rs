use async_trait::async_trait;
use easel_core::{CollabError, Shape, ShapeId};

use crate::feed::Subscription;

/// Single-document edit run inside the backend's read-modify-write.
/// Returning an error aborts the write.
pub type ShapeEdit = Box<dyn FnOnce(&mut Shape) -> Result<(), CollabError> + Send>;

/// Precondition for a conditional delete.
pub type ShapeCheck = Box<dyn FnOnce(&Shape) -> Result<(), CollabError> + Send>;

/// Bulk edit applied to every document in one transaction.
/// Returns `true` when it changed the shape.
pub type BulkEdit = Box<dyn FnMut(&mut Shape) -> bool + Send>;

/// Result of a committed `modify`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeChange {
    pub before: Shape,
    pub after: Shape,
}

impl ShapeChange {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Durable shape storage with push notifications.
///
/// Every mutating call is one transaction: it either commits entirely and
/// publishes exactly one ordered snapshot, or leaves the store untouched.
/// Edits that leave a document unchanged are not written and not published.
#[async_trait]
pub trait ShapeBackend: Send + Sync {
    /// Insert a new document. Fails with `InvalidShape` if the id exists.
    async fn insert(&self, shape: Shape) -> Result<(), CollabError>;

    async fn get(&self, id: ShapeId) -> Result<Option<Shape>, CollabError>;

    /// All documents ordered by `created_at`, ties broken by id.
    async fn list(&self) -> Result<Vec<Shape>, CollabError>;

    /// Atomic read-modify-write of one document.
    async fn modify(&self, id: ShapeId, edit: ShapeEdit) -> Result<ShapeChange, CollabError>;

    /// Atomic conditional delete. Returns the removed document.
    async fn remove_if(&self, id: ShapeId, check: ShapeCheck) -> Result<Shape, CollabError>;

    /// Apply `edit` to every document in one transaction. Returns how many
    /// documents changed.
    async fn modify_all(&self, edit: BulkEdit) -> Result<usize, CollabError>;

    /// Delete every document in one transaction.
    async fn remove_all(&self) -> Result<usize, CollabError>;

    /// Ordered snapshots, starting with the current one.
    fn subscribe(&self) -> Subscription<Vec<Shape>>;
}

pub(crate) fn sort_shapes(shapes: &mut [Shape]) {
    shapes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

use async_trait::async_trait;
use easel_core::{CollabError, Shape, ShapeId};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockWriteGuard};

use super::backend::{sort_shapes, BulkEdit, ShapeBackend, ShapeChange, ShapeCheck, ShapeEdit};
use crate::feed::{Feed, Subscription};

/// In-process shape store shared by every session in the process.
///
/// Snapshots are published while the write lock is held, so subscribers
/// observe commits in the same total order they were applied.
pub struct MemoryBackend {
    shapes: RwLock<HashMap<ShapeId, Shape>>,
    feed: Feed<Vec<Shape>>,
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new(feed_capacity: usize) -> Self {
        Self {
            shapes: RwLock::new(HashMap::new()),
            feed: Feed::with_value(feed_capacity, Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate a backend outage: every call fails with `StoreUnavailable`
    /// until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    fn check_online(&self) -> Result<(), CollabError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CollabError::StoreUnavailable("memory backend offline".into()));
        }
        Ok(())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ShapeId, Shape>> {
        self.shapes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, shapes: &HashMap<ShapeId, Shape>) {
        let mut snapshot: Vec<Shape> = shapes.values().cloned().collect();
        sort_shapes(&mut snapshot);
        self.feed.publish(snapshot);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ShapeBackend for MemoryBackend {
    async fn insert(&self, shape: Shape) -> Result<(), CollabError> {
        self.check_online()?;
        let mut shapes = self.write();
        if shapes.contains_key(&shape.id) {
            return Err(CollabError::InvalidShape(format!("duplicate shape id {}", shape.id)));
        }
        shapes.insert(shape.id, shape);
        self.publish(&shapes);
        Ok(())
    }

    async fn get(&self, id: ShapeId) -> Result<Option<Shape>, CollabError> {
        self.check_online()?;
        let shapes = self.shapes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(shapes.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Shape>, CollabError> {
        self.check_online()?;
        let shapes = self.shapes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut list: Vec<Shape> = shapes.values().cloned().collect();
        sort_shapes(&mut list);
        Ok(list)
    }

    async fn modify(&self, id: ShapeId, edit: ShapeEdit) -> Result<ShapeChange, CollabError> {
        self.check_online()?;
        let mut shapes = self.write();
        let current = shapes.get(&id).ok_or(CollabError::NotFound(id))?;
        let before = current.clone();
        let mut after = before.clone();
        edit(&mut after)?;

        let change = ShapeChange { before, after };
        if change.changed() {
            shapes.insert(id, change.after.clone());
            self.publish(&shapes);
        }
        Ok(change)
    }

    async fn remove_if(&self, id: ShapeId, check: ShapeCheck) -> Result<Shape, CollabError> {
        self.check_online()?;
        let mut shapes = self.write();
        let current = shapes.get(&id).ok_or(CollabError::NotFound(id))?;
        check(current)?;
        let removed = shapes.remove(&id).ok_or(CollabError::NotFound(id))?;
        self.publish(&shapes);
        Ok(removed)
    }

    async fn modify_all(&self, mut edit: BulkEdit) -> Result<usize, CollabError> {
        self.check_online()?;
        let mut shapes = self.write();
        let mut changed = 0;
        for shape in shapes.values_mut() {
            if edit(shape) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.publish(&shapes);
        }
        debug!("Bulk edit changed {} shapes", changed);
        Ok(changed)
    }

    async fn remove_all(&self) -> Result<usize, CollabError> {
        self.check_online()?;
        let mut shapes = self.write();
        let removed = shapes.len();
        if removed > 0 {
            shapes.clear();
            self.publish(&shapes);
        }
        Ok(removed)
    }

    fn subscribe(&self) -> Subscription<Vec<Shape>> {
        self.feed.subscribe()
    }
}

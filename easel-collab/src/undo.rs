//! Bounded undo/redo of shape mutations.
//!
//! Actions record intent (what was created, changed or deleted), not locks.
//! Replaying an action goes back through `ShapeStore`, so the lock gate
//! still applies and undo can never mutate a shape another session holds.

use easel_core::{Shape, ShapeId, ShapeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum UndoAction {
    Create { shape: Shape },
    Update { id: ShapeId, before: ShapeKind, after: ShapeKind },
    Delete { shape: Shape },
    DeleteMultiple { shapes: Vec<Shape> },
}

impl UndoAction {
    pub fn label(&self) -> &'static str {
        match self {
            UndoAction::Create { .. } => "create",
            UndoAction::Update { .. } => "update",
            UndoAction::Delete { .. } => "delete",
            UndoAction::DeleteMultiple { .. } => "delete multiple",
        }
    }
}

/// Two bounded stacks plus a replay flag.
pub struct UndoRedoManager {
    undo_stack: Vec<UndoAction>,
    redo_stack: Vec<UndoAction>,
    capacity: usize,
    replaying: Arc<AtomicBool>,
}

impl UndoRedoManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            capacity: capacity.max(1),
            replaying: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Push a new action. Clears the redo branch and evicts the oldest
    /// entry past capacity. Ignored while a replay is in progress.
    pub fn record(&mut self, action: UndoAction) {
        if self.is_replaying() {
            return;
        }
        self.redo_stack.clear();
        push_bounded(&mut self.undo_stack, action, self.capacity);
    }

    /// Move the newest action to the redo stack and hand it back for the
    /// caller to invert.
    pub fn undo(&mut self) -> Option<UndoAction> {
        let action = self.undo_stack.pop()?;
        push_bounded(&mut self.redo_stack, action.clone(), self.capacity);
        Some(action)
    }

    /// Move the newest undone action back and hand it back for the caller
    /// to reapply.
    pub fn redo(&mut self) -> Option<UndoAction> {
        let action = self.redo_stack.pop()?;
        push_bounded(&mut self.undo_stack, action.clone(), self.capacity);
        Some(action)
    }

    /// Hold the returned guard while applying an undone/redone action so
    /// the resulting mutations are not recorded again.
    pub fn begin_replay(&self) -> ReplayGuard {
        self.replaying.store(true, Ordering::SeqCst);
        ReplayGuard {
            flag: self.replaying.clone(),
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

impl Default for UndoRedoManager {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Clears the replay flag on drop.
pub struct ReplayGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

fn push_bounded(stack: &mut Vec<UndoAction>, action: UndoAction, capacity: usize) {
    stack.push(action);
    while stack.len() > capacity {
        stack.remove(0);
    }
}

//! Per-session facade: the UI event contract on top of every component.
//!
//! ```text
//!          UI events                      SessionEvent stream
//!   drag/select/create/undo                       ▲
//!             │                                   │
//!             ▼                                   │
//!   ┌─────────────────── CollabSession ───────────┴──────────┐
//!   │ LockCoordinator  ShapeStore  UndoRedoManager            │
//!   │ PresenceTracker  CursorBroadcaster  ConnectionMonitor   │
//!   └──────────────────────────────────────────────────────────┘
//!            │                              │
//!      dyn ShapeBackend             dyn EphemeralRegistry
//! ```
//!
//! The reactive loop started by [`CollabSession::start`] owns the three
//! subscription pipelines. It diffs presence snapshots and force-releases
//! the locks of departed users, keeps the local selection in line with the
//! live lock holders, and after every reconnect re-arms presence and the
//! cursor binding and rebuilds every pipeline.

use easel_core::{CollabError, Shape, ShapeId, ShapeKind, ShapePatch, UserId};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CollabConfig;
use crate::connection::{ConnectionEvent, ConnectionMonitor};
use crate::cursor::{CursorBroadcaster, CursorSubscription, RemoteCursor};
use crate::feed::Subscription;
use crate::identity::{Identity, SessionUser};
use crate::lock::LockCoordinator;
use crate::presence::{departures, PresenceSet, PresenceSubscription, PresenceTracker};
use crate::registry::EphemeralRegistry;
use crate::store::{ShapeBackend, ShapeChange, ShapeStore};
use crate::undo::{UndoAction, UndoRedoManager};

/// Events emitted by the session loop and the UI operations.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Every shape, `created_at` ascending
    Shapes(Arc<Vec<Shape>>),
    /// Everyone currently online, this session included
    Presence(PresenceSet),
    /// Other sessions' cursors
    Cursors(Vec<RemoteCursor>),
    Connection(ConnectionEvent),
    /// Locks of a departed user were cleared
    LocksReleased { user: UserId, count: usize },
    /// Shapes this session holds as its selection
    SelectionChanged(Vec<ShapeId>),
}

/// Session counters. Best-effort failures show up here instead of as
/// errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub locks_acquired: u64,
    pub lock_conflicts: u64,
    pub departures_handled: u64,
    pub locks_recovered: u64,
    pub recovery_failures: u64,
    pub presence_failures: u64,
    pub rearms: u64,
    pub events_dropped: u64,
    pub cursor_writes: u64,
    pub cursor_failures: u64,
}

#[derive(Default)]
struct AtomicSessionStats {
    locks_acquired: AtomicU64,
    lock_conflicts: AtomicU64,
    departures_handled: AtomicU64,
    locks_recovered: AtomicU64,
    recovery_failures: AtomicU64,
    presence_failures: AtomicU64,
    rearms: AtomicU64,
    events_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

struct SessionInner {
    identity: Identity,
    registry: Arc<dyn EphemeralRegistry>,
    store: ShapeStore,
    locks: LockCoordinator,
    presence: PresenceTracker,
    cursors: CursorBroadcaster,
    selection: Mutex<BTreeSet<ShapeId>>,
    history: Mutex<UndoRedoManager>,
    event_tx: mpsc::Sender<SessionEvent>,
    stats: AtomicSessionStats,
    leaving: AtomicBool,
}

impl SessionInner {
    fn selection(&self) -> MutexGuard<'_, BTreeSet<ShapeId>> {
        self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, UndoRedoManager> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn selected(&self) -> Vec<ShapeId> {
        self.selection().iter().copied().collect()
    }

    /// Never blocks the loop; a full or abandoned channel drops the event.
    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                log::warn!("Session event channel full, dropping event");
            }
            bump(&self.stats.events_dropped, 1);
        }
    }

    fn emit_selection(&self) {
        self.emit(SessionEvent::SelectionChanged(self.selected()));
    }

    /// Arm presence and the cursor binding on the current connection.
    async fn rearm(&self, me: &SessionUser) {
        if let Err(e) = self.presence.join(&me.user_id, &me.display_name).await {
            log::warn!("Presence join for {} failed: {}", me.user_id, e);
            bump(&self.stats.presence_failures, 1);
        }
        if let Err(e) = self.cursors.arm_disconnect(&me.user_id).await {
            log::warn!("Cursor binding for {} failed: {}", me.user_id, e);
            bump(&self.stats.presence_failures, 1);
        }
        bump(&self.stats.rearms, 1);
    }

    async fn subscribe_presence(&self) -> Option<PresenceSubscription> {
        match self.presence.subscribe().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                log::warn!("Presence subscription failed: {}", e);
                None
            }
        }
    }

    async fn subscribe_cursors(&self, me: &UserId) -> Option<CursorSubscription> {
        match self.cursors.subscribe(me).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                log::warn!("Cursor subscription failed: {}", e);
                None
            }
        }
    }

    /// Release everything `user` holds. Departure is the only trigger.
    async fn recover_locks(&self, me: &SessionUser, user: UserId) {
        bump(&self.stats.departures_handled, 1);
        if user == me.user_id {
            if self.leaving.load(Ordering::SeqCst) {
                return;
            }
            // Our own record vanished while we are still running: the
            // registry saw a drop we did not. Put it back.
            log::warn!("Own presence record for {} disappeared, re-arming", user);
            self.rearm(me).await;
            return;
        }
        match self.locks.force_release_all(&user).await {
            Ok(count) => {
                log::info!("{} departed; released {} locks", user, count);
                bump(&self.stats.locks_recovered, count as u64);
                if count > 0 {
                    self.emit(SessionEvent::LocksReleased { user, count });
                }
            }
            Err(e) => {
                log::warn!("Lock recovery for departed {} failed: {}", user, e);
                bump(&self.stats.recovery_failures, 1);
            }
        }
    }

    /// Drop selected shapes that are gone or no longer held by `me`.
    ///
    /// Snapshots can be older than a local acquire, so a shape the snapshot
    /// shows unlocked is only dropped once the live lock confirms it.
    async fn reconcile_selection(&self, me: &UserId, shapes: &[Shape]) -> bool {
        let candidates: Vec<ShapeId> = self
            .selected()
            .into_iter()
            .filter(|id| !shapes.iter().any(|shape| shape.id == *id && shape.is_locked_by(me)))
            .collect();

        let mut trimmed = false;
        for id in candidates {
            match self.locks.holder_of(id).await {
                Ok(Some(holder)) if holder == *me => continue,
                Ok(_) | Err(CollabError::NotFound(_)) => {}
                Err(e) => {
                    log::warn!("Could not verify lock on selected shape {}: {}", id, e);
                    continue;
                }
            }
            if !self.selection().remove(&id) {
                continue;
            }
            // A drag start may have acquired between the check and the removal.
            if let Ok(Some(holder)) = self.locks.holder_of(id).await {
                if holder == *me {
                    self.selection().insert(id);
                    continue;
                }
            }
            trimmed = true;
        }
        trimmed
    }

    async fn run(self: Arc<Self>, me: SessionUser) {
        let mut monitor = ConnectionMonitor::new(self.registry.connectivity());
        let mut monitor_alive = true;
        let mut shapes: Option<Subscription<Vec<Shape>>> = Some(self.store.subscribe());
        let mut presence = self.subscribe_presence().await;
        let mut cursors = self.subscribe_cursors(&me.user_id).await;
        let mut last_presence: Option<PresenceSet> = None;

        log::debug!("Session loop for {} started", me.user_id);
        loop {
            tokio::select! {
                snapshot = next_or_pending(shapes.as_mut().map(|s| s.next())) => {
                    match snapshot {
                        Some(list) => {
                            if self.reconcile_selection(&me.user_id, &list).await {
                                log::info!("Selection trimmed to shapes still held by {}", me.user_id);
                                self.emit_selection();
                            }
                            self.emit(SessionEvent::Shapes(list));
                        }
                        None => {
                            log::warn!("Shape subscription ended");
                            shapes = None;
                        }
                    }
                }

                set = next_or_pending(presence.as_mut().map(|s| s.next())) => {
                    match set {
                        Some(set) => {
                            if let Some(prev) = last_presence.as_ref() {
                                for user in departures(prev, &set) {
                                    self.recover_locks(&me, user).await;
                                }
                            }
                            last_presence = Some(set.clone());
                            self.emit(SessionEvent::Presence(set));
                        }
                        None => {
                            log::debug!("Presence subscription ended");
                            presence = None;
                        }
                    }
                }

                list = next_or_pending(cursors.as_mut().map(|s| s.next())) => {
                    match list {
                        Some(list) => self.emit(SessionEvent::Cursors(list)),
                        None => {
                            log::debug!("Cursor subscription ended");
                            cursors = None;
                        }
                    }
                }

                event = monitor.next(), if monitor_alive => {
                    match event {
                        Some(ConnectionEvent::Disconnected) => {
                            presence = None;
                            cursors = None;
                            self.emit(SessionEvent::Connection(ConnectionEvent::Disconnected));
                        }
                        Some(event) => {
                            log::info!("Re-arming session {} after {:?}", me.user_id, event);
                            self.rearm(&me).await;
                            shapes = Some(self.store.subscribe());
                            presence = self.subscribe_presence().await;
                            cursors = self.subscribe_cursors(&me.user_id).await;
                            self.emit(SessionEvent::Connection(event));
                        }
                        None => monitor_alive = false,
                    }
                }
            }
        }
    }
}

async fn next_or_pending<T, F>(next: Option<F>) -> Option<T>
where
    F: Future<Output = Option<T>>,
{
    match next {
        Some(next) => next.await,
        None => std::future::pending().await,
    }
}

/// One collaborating session.
pub struct CollabSession {
    inner: Arc<SessionInner>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl CollabSession {
    pub fn new(
        config: CollabConfig,
        identity: Identity,
        backend: Arc<dyn ShapeBackend>,
        registry: Arc<dyn EphemeralRegistry>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let inner = SessionInner {
            store: ShapeStore::new(backend.clone(), identity.clone()),
            locks: LockCoordinator::new(backend),
            presence: PresenceTracker::new(registry.clone()),
            cursors: CursorBroadcaster::new(registry.clone(), config.cursor_throttle),
            identity,
            registry,
            selection: Mutex::new(BTreeSet::new()),
            history: Mutex::new(UndoRedoManager::new(config.undo_capacity)),
            event_tx,
            stats: AtomicSessionStats::default(),
            leaving: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
            event_rx: Some(event_rx),
            loop_task: Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Join presence, arm the cursor binding and spawn the reactive loop.
    /// Registry failures are logged; the loop re-arms on the next connect.
    pub async fn start(&self) -> Result<(), CollabError> {
        let me = self.inner.identity.require()?;
        self.inner.leaving.store(false, Ordering::SeqCst);
        self.inner.rearm(&me).await;

        let task = tokio::spawn(self.inner.clone().run(me.clone()));
        if let Some(previous) = self.loop_task().replace(task) {
            previous.abort();
        }
        log::info!("Session started for {} ({})", me.display_name, me.user_id);
        Ok(())
    }

    fn loop_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── UI event contract ─────────────────────────────────────────

    /// Try to lock `id` for dragging. `Ok(false)` means another session
    /// holds it and the drag must not start.
    pub async fn on_shape_drag_start(&self, id: ShapeId) -> Result<bool, CollabError> {
        let me = self.inner.identity.require()?;
        let acquired = self.inner.locks.acquire(id, &me.user_id).await?;
        if acquired {
            bump(&self.inner.stats.locks_acquired, 1);
            let added = self.inner.selection().insert(id);
            if added {
                self.inner.emit_selection();
            }
        } else {
            bump(&self.inner.stats.lock_conflicts, 1);
        }
        Ok(acquired)
    }

    /// Commit the drop position. The lock stays until deselect.
    pub async fn on_shape_drag_end(&self, id: ShapeId, x: f32, y: f32) -> Result<(), CollabError> {
        self.update_shape(id, ShapePatch::position(x, y)).await?;
        Ok(())
    }

    /// Replace (`toggle == false`) or toggle the selection. Shapes that
    /// cannot be locked are left out. Returns the resulting selection.
    pub async fn on_select(&self, ids: &[ShapeId], toggle: bool) -> Result<Vec<ShapeId>, CollabError> {
        let me = self.inner.identity.require()?;

        if toggle {
            for id in ids {
                let selected = self.inner.selection().contains(id);
                if selected {
                    self.inner.locks.release(*id, &me.user_id).await;
                    self.inner.selection().remove(id);
                } else {
                    self.try_select(*id, &me.user_id).await;
                }
            }
        } else {
            let wanted: BTreeSet<ShapeId> = ids.iter().copied().collect();
            let dropped: Vec<ShapeId> = self
                .inner
                .selected()
                .into_iter()
                .filter(|id| !wanted.contains(id))
                .collect();
            self.inner.locks.release_many(&dropped, &me.user_id).await;
            {
                let mut selection = self.inner.selection();
                for id in &dropped {
                    selection.remove(id);
                }
            }
            for id in wanted {
                self.try_select(id, &me.user_id).await;
            }
        }

        self.inner.emit_selection();
        Ok(self.inner.selected())
    }

    async fn try_select(&self, id: ShapeId, me: &UserId) {
        match self.inner.locks.acquire(id, me).await {
            Ok(true) => {
                bump(&self.inner.stats.locks_acquired, 1);
                self.inner.selection().insert(id);
            }
            Ok(false) => {
                bump(&self.inner.stats.lock_conflicts, 1);
                log::debug!("{} left out of selection: locked elsewhere", id);
            }
            Err(e) => log::warn!("{} left out of selection: {}", id, e),
        }
    }

    /// Release every selected shape.
    pub async fn on_deselect_all(&self) -> Result<(), CollabError> {
        let me = self.inner.identity.require()?;
        let selected = std::mem::take(&mut *self.inner.selection());
        let ids: Vec<ShapeId> = selected.into_iter().collect();
        self.inner.locks.release_many(&ids, &me.user_id).await;
        self.inner.emit_selection();
        Ok(())
    }

    pub fn selection(&self) -> Vec<ShapeId> {
        self.inner.selected()
    }

    // ── Shape mutations ───────────────────────────────────────────

    pub async fn create_shape(&self, kind: ShapeKind) -> Result<ShapeId, CollabError> {
        let id = self.inner.store.create(kind).await?;
        match self.inner.store.get(id).await? {
            Some(shape) => self.inner.history().record(UndoAction::Create { shape }),
            None => log::warn!("Created shape {} vanished before it was recorded", id),
        }
        Ok(id)
    }

    pub async fn update_shape(&self, id: ShapeId, patch: ShapePatch) -> Result<ShapeChange, CollabError> {
        let change = self.inner.store.update(id, patch).await?;
        if change.changed() {
            self.inner.history().record(UndoAction::Update {
                id,
                before: change.before.kind.clone(),
                after: change.after.kind.clone(),
            });
        }
        Ok(change)
    }

    /// Delete every selected shape. Shapes that fail are kept and logged;
    /// the call fails only if nothing could be deleted.
    pub async fn delete_selected(&self) -> Result<usize, CollabError> {
        self.inner.identity.require()?;
        let mut removed = Vec::new();
        let mut first_error = None;

        for id in self.inner.selected() {
            match self.inner.store.delete(id).await {
                Ok(shape) => removed.push(shape),
                Err(CollabError::NotFound(_)) => log::debug!("{} already deleted", id),
                Err(e) => {
                    log::warn!("Could not delete {}: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        {
            let mut selection = self.inner.selection();
            for shape in &removed {
                selection.remove(&shape.id);
            }
        }
        self.inner.emit_selection();

        let count = removed.len();
        match removed.len() {
            0 => {
                if let Some(e) = first_error {
                    return Err(e);
                }
            }
            1 => {
                let shape = removed.remove(0);
                self.inner.history().record(UndoAction::Delete { shape });
            }
            _ => self.inner.history().record(UndoAction::DeleteMultiple { shapes: removed }),
        }
        Ok(count)
    }

    /// Best-effort pointer broadcast.
    pub async fn move_cursor(&self, x: f32, y: f32) {
        match self.inner.identity.current() {
            Some(me) => {
                self.inner
                    .cursors
                    .publish(&me.user_id, &me.display_name, x, y)
                    .await
            }
            None => log::trace!("Cursor move ignored: not signed in"),
        }
    }

    // ── History ───────────────────────────────────────────────────

    /// Invert the newest action. `Ok(false)` when there is nothing to undo.
    /// On failure the action stays on the undo stack.
    pub async fn undo(&self) -> Result<bool, CollabError> {
        self.inner.identity.require()?;
        let (action, _replay) = {
            let mut history = self.inner.history();
            match history.undo() {
                Some(action) => (action, history.begin_replay()),
                None => return Ok(false),
            }
        };

        log::debug!("Undoing {}", action.label());
        let result = match &action {
            UndoAction::Create { shape } => self.inner.store.delete(shape.id).await.map(|_| ()),
            UndoAction::Update { id, before, .. } => self
                .inner
                .store
                .update(*id, ShapePatch::from(before))
                .await
                .map(|_| ()),
            UndoAction::Delete { shape } => self.inner.store.restore(shape.clone()).await.map(|_| ()),
            UndoAction::DeleteMultiple { shapes } => self.restore_all(shapes).await,
        };

        if let Err(e) = result {
            log::warn!("Undo of {} failed: {}", action.label(), e);
            self.inner.history().redo();
            return Err(e);
        }
        Ok(true)
    }

    /// Reapply the newest undone action. On failure the action stays on
    /// the redo stack.
    pub async fn redo(&self) -> Result<bool, CollabError> {
        self.inner.identity.require()?;
        let (action, _replay) = {
            let mut history = self.inner.history();
            match history.redo() {
                Some(action) => (action, history.begin_replay()),
                None => return Ok(false),
            }
        };

        log::debug!("Redoing {}", action.label());
        let result = match &action {
            UndoAction::Create { shape } => self.inner.store.restore(shape.clone()).await.map(|_| ()),
            UndoAction::Update { id, after, .. } => self
                .inner
                .store
                .update(*id, ShapePatch::from(after))
                .await
                .map(|_| ()),
            UndoAction::Delete { shape } => self.inner.store.delete(shape.id).await.map(|_| ()),
            UndoAction::DeleteMultiple { shapes } => {
                let mut result = Ok(());
                for shape in shapes {
                    match self.inner.store.delete(shape.id).await {
                        Ok(_) | Err(CollabError::NotFound(_)) => {}
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                result
            }
        };

        if let Err(e) = result {
            log::warn!("Redo of {} failed: {}", action.label(), e);
            self.inner.history().undo();
            return Err(e);
        }
        Ok(true)
    }

    async fn restore_all(&self, shapes: &[Shape]) -> Result<(), CollabError> {
        for shape in shapes {
            self.inner.store.restore(shape.clone()).await?;
        }
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        self.inner.history().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.history().can_redo()
    }

    // ── Teardown ──────────────────────────────────────────────────

    /// Graceful logout: release every lock, remove cursor and presence,
    /// then stop the loop. Runs to completion while the identity is still
    /// available.
    pub async fn leave(&self) -> Result<(), CollabError> {
        let me = self.inner.identity.require()?;
        self.inner.leaving.store(true, Ordering::SeqCst);
        if let Some(task) = self.loop_task().take() {
            task.abort();
        }

        let selected = std::mem::take(&mut *self.inner.selection());
        let ids: Vec<ShapeId> = selected.into_iter().collect();
        self.inner.locks.release_many(&ids, &me.user_id).await;
        if let Err(e) = self.inner.locks.force_release_all(&me.user_id).await {
            log::warn!("Releasing remaining locks for {} failed: {}", me.user_id, e);
        }

        if let Err(e) = self.inner.cursors.remove(&me.user_id).await {
            log::warn!("Cursor removal for {} failed: {}", me.user_id, e);
        }
        if let Err(e) = self.inner.presence.leave(&me.user_id).await {
            log::warn!("Presence removal for {} failed: {}", me.user_id, e);
            bump(&self.inner.stats.presence_failures, 1);
        }

        self.inner.history().clear();
        log::info!("{} left the session", me.user_id);
        Ok(())
    }

    pub fn stats(&self) -> SessionStats {
        let s = &self.inner.stats;
        SessionStats {
            locks_acquired: s.locks_acquired.load(Ordering::Relaxed),
            lock_conflicts: s.lock_conflicts.load(Ordering::Relaxed),
            departures_handled: s.departures_handled.load(Ordering::Relaxed),
            locks_recovered: s.locks_recovered.load(Ordering::Relaxed),
            recovery_failures: s.recovery_failures.load(Ordering::Relaxed),
            presence_failures: s.presence_failures.load(Ordering::Relaxed),
            rearms: s.rearms.load(Ordering::Relaxed),
            events_dropped: s.events_dropped.load(Ordering::Relaxed),
            cursor_writes: self.inner.cursors.writes(),
            cursor_failures: self.inner.cursors.failures(),
        }
    }

    pub fn store(&self) -> &ShapeStore {
        &self.inner.store
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.inner.locks
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task().take() {
            task.abort();
        }
    }
}

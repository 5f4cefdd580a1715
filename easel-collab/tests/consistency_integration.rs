//! End-to-end consistency tests over the in-process backends.
//!
//! Every session gets its own registry connection on a shared hub and all
//! sessions share one shape backend, so connection drops, presence diffs
//! and lock recovery run exactly as they would across processes.

use easel_collab::connection::ConnectionEvent;
use easel_collab::cursor::{CursorRecord, CURSOR_NAMESPACE};
use easel_collab::identity::{Identity, SessionUser};
use easel_collab::lock::LockCoordinator;
use easel_collab::presence::PRESENCE_NAMESPACE;
use easel_collab::registry::{MemoryRegistry, RegistryHub};
use easel_collab::session::{CollabSession, SessionEvent};
use easel_collab::store::{MemoryBackend, ShapeStore};
use easel_collab::CollabConfig;
use easel_core::{CollabError, Shape, ShapeId, ShapeKind, ShapePatch, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

struct TestSession {
    session: CollabSession,
    events: mpsc::Receiver<SessionEvent>,
    conn: Arc<MemoryRegistry>,
}

async fn join(backend: &Arc<MemoryBackend>, hub: &RegistryHub, user: &str) -> TestSession {
    let conn = Arc::new(hub.connect());
    let mut session = CollabSession::new(
        CollabConfig::default(),
        Identity::signed_in(SessionUser::new(user, user.to_uppercase())),
        backend.clone(),
        conn.clone(),
    );
    let events = session.take_event_rx().unwrap();
    session.start().await.unwrap();
    TestSession { session, events, conn }
}

/// Wait until the session emits an event matching `pred`.
async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("Session event stream ended");
    })
    .await
    .expect("Timed out waiting for session event")
}

fn sees_present(event: &SessionEvent, user: &str) -> bool {
    matches!(event, SessionEvent::Presence(set) if set.contains_key(&UserId::from(user)))
}

async fn seed(backend: &Arc<MemoryBackend>, n: usize) -> Vec<ShapeId> {
    let store = ShapeStore::new(
        backend.clone(),
        Identity::signed_in(SessionUser::new("seed", "Seed")),
    );
    let mut ids = Vec::new();
    for i in 0..n {
        let id = store
            .create(ShapeKind::rectangle(i as f32 * 20.0, 0.0, 10.0, 10.0))
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

// ── Mutual exclusion ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_single_winner() {
    let backend = Arc::new(MemoryBackend::default());
    let ids = seed(&backend, 3).await;
    let locks = LockCoordinator::new(backend.clone());

    for id in ids {
        let mut tasks = Vec::new();
        for n in 0..12 {
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                locks.acquire(id, &UserId::new(format!("user-{n}"))).await.unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one session may hold {id}");
        assert!(locks.holder_of(id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_mutation_gate_rejects_stale_holder() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;
    let bob = join(&backend, &hub, "bob").await;

    let id = alice.session.create_shape(ShapeKind::circle(0.0, 0.0, 8.0)).await.unwrap();
    assert!(alice.session.on_shape_drag_start(id).await.unwrap());

    // Operator recovery hands the shape to bob while alice still believes
    // she holds it.
    alice.session.locks().admin_clear_all_locks().await.unwrap();
    assert!(bob.session.on_shape_drag_start(id).await.unwrap());

    let moved = alice.session.on_shape_drag_end(id, 99.0, 99.0).await;
    assert!(matches!(moved, Err(CollabError::LockConflict { .. })));
    let err = alice.session.store().delete(id).await.unwrap_err();
    assert!(err.is_lock_conflict());

    let shape = bob.session.store().get(id).await.unwrap().unwrap();
    assert_eq!(shape.kind.position(), (0.0, 0.0));
}

// ── Lock scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn test_acquire_conflict_release_retry() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;
    let bob = join(&backend, &hub, "bob").await;
    let ids = seed(&backend, 1).await;
    let s1 = ids[0];

    assert!(alice.session.on_shape_drag_start(s1).await.unwrap());
    assert!(!bob.session.on_shape_drag_start(s1).await.unwrap());
    alice.session.on_deselect_all().await.unwrap();
    assert!(bob.session.on_shape_drag_start(s1).await.unwrap());
}

#[tokio::test]
async fn test_departure_releases_exactly_departed_locks() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let ids = seed(&backend, 3).await;

    let alice = join(&backend, &hub, "alice").await;
    let carol = join(&backend, &hub, "carol").await;
    let mut bob = join(&backend, &hub, "bob").await;
    wait_for(&mut bob.events, |e| sees_present(e, "alice") && sees_present(e, "carol")).await;

    let mut held = alice.session.on_select(&ids[..2], false).await.unwrap();
    let mut expected = ids[..2].to_vec();
    held.sort();
    expected.sort();
    assert_eq!(held, expected);
    assert!(carol.session.on_shape_drag_start(ids[2]).await.unwrap());

    alice.conn.disconnect();

    match wait_for(&mut bob.events, |e| matches!(e, SessionEvent::LocksReleased { .. })).await {
        SessionEvent::LocksReleased { user, count } => {
            assert_eq!(user, UserId::from("alice"));
            assert_eq!(count, 2);
        }
        other => panic!("Expected LocksReleased, got {other:?}"),
    }

    let locks = bob.session.locks();
    assert_eq!(locks.holder_of(ids[0]).await.unwrap(), None);
    assert_eq!(locks.holder_of(ids[1]).await.unwrap(), None);
    assert_eq!(locks.holder_of(ids[2]).await.unwrap(), Some(UserId::from("carol")));
    assert!(bob.session.on_shape_drag_start(ids[0]).await.unwrap());
    assert_eq!(bob.session.stats().locks_recovered, 2);
}

#[tokio::test]
async fn test_departed_holder_selection_reconciled_after_return() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let ids = seed(&backend, 1).await;

    let mut alice = join(&backend, &hub, "alice").await;
    let mut bob = join(&backend, &hub, "bob").await;
    wait_for(&mut bob.events, |e| sees_present(e, "alice")).await;
    assert!(alice.session.on_shape_drag_start(ids[0]).await.unwrap());

    // Alice drops, bob recovers her lock and takes the shape.
    alice.conn.reconnect();
    wait_for(&mut bob.events, |e| matches!(e, SessionEvent::LocksReleased { .. })).await;
    assert!(bob.session.on_shape_drag_start(ids[0]).await.unwrap());

    // Alice's selection no longer reflects a lock she holds.
    wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::SelectionChanged(sel) if sel.is_empty())
    })
    .await;
    assert!(alice.session.selection().is_empty());
}

// ── Selection under a running loop ───────────────────────────────

#[tokio::test]
async fn test_drag_right_after_create_keeps_selection() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;
    let locks = alice.session.locks();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The create snapshot (shape unlocked) reaches the loop after the drag.
    let id = alice
        .session
        .create_shape(ShapeKind::circle(50.0, 50.0, 20.0))
        .await
        .unwrap();
    assert!(alice.session.on_shape_drag_start(id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.session.selection(), vec![id]);
    assert_eq!(locks.holder_of(id).await.unwrap(), Some(UserId::from("alice")));

    alice.session.on_deselect_all().await.unwrap();
    assert_eq!(locks.holder_of(id).await.unwrap(), None);
}

fn held_by(shapes: &[Shape], user: &str) -> Vec<ShapeId> {
    let user = UserId::from(user);
    let mut ids: Vec<ShapeId> = shapes
        .iter()
        .filter(|shape| shape.is_locked_by(&user))
        .map(|shape| shape.id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_selection_tracks_locks_under_rapid_operations() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;
    let bob = join(&backend, &hub, "bob").await;
    let store = ShapeStore::new(
        backend.clone(),
        Identity::signed_in(SessionUser::new("seed", "Seed")),
    );

    let mut ids = Vec::new();
    for i in 0..6 {
        let id = alice
            .session
            .create_shape(ShapeKind::rectangle(i as f32 * 15.0, 0.0, 10.0, 10.0))
            .await
            .unwrap();
        assert!(alice.session.on_shape_drag_start(id).await.unwrap());
        ids.push(id);
    }

    alice.session.on_select(&ids[..3], false).await.unwrap();
    let (toggled, grabbed) = tokio::join!(
        alice.session.on_select(&[ids[0], ids[4]], true),
        bob.session.on_shape_drag_start(ids[5]),
    );
    toggled.unwrap();
    assert!(grabbed.unwrap());
    assert!(alice.session.on_shape_drag_start(ids[3]).await.unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;

    let shapes = store.list().await.unwrap();
    let mut expected = vec![ids[1], ids[2], ids[3], ids[4]];
    expected.sort();
    let mut selected = alice.session.selection();
    selected.sort();
    assert_eq!(selected, expected);
    assert_eq!(held_by(&shapes, "alice"), expected);
    assert_eq!(bob.session.selection(), vec![ids[5]]);
    assert_eq!(held_by(&shapes, "bob"), vec![ids[5]]);

    alice.session.on_deselect_all().await.unwrap();
    let shapes = store.list().await.unwrap();
    assert!(held_by(&shapes, "alice").is_empty());
    assert_eq!(held_by(&shapes, "bob"), vec![ids[5]]);
    assert!(alice.session.selection().is_empty());
}

// ── Reconnect ────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_rearms_presence_and_cursor_binding() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let mut alice = join(&backend, &hub, "alice").await;
    assert_eq!(alice.conn.binding_count(), 2);

    alice.conn.reconnect();
    wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::Connection(ConnectionEvent::Reconnected))
    })
    .await;

    assert!(hub.snapshot(PRESENCE_NAMESPACE).contains_key("alice"));
    assert_eq!(alice.conn.binding_count(), 2);
    assert!(alice.session.stats().rearms >= 2);

    // Fresh pipelines deliver again after the blip.
    let bob = join(&backend, &hub, "bob").await;
    wait_for(&mut alice.events, |e| sees_present(e, "bob")).await;

    bob.conn.disconnect();
    wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::Presence(set) if !set.contains_key(&UserId::from("bob")))
    })
    .await;
}

// ── Store ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_clear_all_is_observed_atomically() {
    let backend = Arc::new(MemoryBackend::default());
    seed(&backend, 5).await;
    let store = ShapeStore::new(
        backend.clone(),
        Identity::signed_in(SessionUser::new("admin", "Admin")),
    );
    let mut sub = store.subscribe();
    assert_eq!(sub.next().await.unwrap().len(), 5);

    assert_eq!(store.clear_all().await.unwrap(), 5);
    let next = sub.next().await.unwrap();
    assert!(next.is_empty());
    assert!(timeout(Duration::from_millis(50), sub.next()).await.is_err());
}

#[tokio::test]
async fn test_every_session_sees_ordered_shapes() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;
    let mut bob = join(&backend, &hub, "bob").await;

    let first = alice.session.create_shape(ShapeKind::text(0.0, 0.0, "one")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = alice.session.create_shape(ShapeKind::text(0.0, 30.0, "two")).await.unwrap();

    let event = wait_for(&mut bob.events, |e| {
        matches!(e, SessionEvent::Shapes(list) if list.len() == 2)
    })
    .await;
    if let SessionEvent::Shapes(list) = event {
        let order: Vec<ShapeId> = list.iter().map(|s: &Shape| s.id).collect();
        assert_eq!(order, vec![first, second]);
    }
}

// ── History ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_undo_history_bounded_to_capacity() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;

    for i in 0..11 {
        alice
            .session
            .create_shape(ShapeKind::circle(i as f32 * 10.0, 0.0, 4.0))
            .await
            .unwrap();
    }

    let mut undone = 0;
    while alice.session.undo().await.unwrap() {
        undone += 1;
    }
    assert_eq!(undone, 10);
    // The oldest creation is unrecoverable through undo.
    let left = alice.session.store().list().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].kind.position(), (0.0, 0.0));
}

#[tokio::test]
async fn test_new_action_invalidates_redo() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;

    let id = alice.session.create_shape(ShapeKind::rectangle(0.0, 0.0, 5.0, 5.0)).await.unwrap();
    alice.session.update_shape(id, ShapePatch::position(1.0, 1.0)).await.unwrap();
    alice.session.update_shape(id, ShapePatch::position(2.0, 2.0)).await.unwrap();
    assert!(alice.session.undo().await.unwrap());
    assert!(alice.session.undo().await.unwrap());
    assert!(alice.session.can_redo());

    alice.session.update_shape(id, ShapePatch::default().with_fill("#ff0000")).await.unwrap();
    assert!(!alice.session.can_redo());
    assert!(!alice.session.redo().await.unwrap());
}

// ── Cursors ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_cursor_burst_leaves_latest_position() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let alice = join(&backend, &hub, "alice").await;

    for i in 0..30 {
        alice.session.move_cursor(i as f32, 0.0).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let stored = hub.snapshot(CURSOR_NAMESPACE);
    let record = CursorRecord::decode(stored.get("alice").unwrap()).unwrap();
    assert_eq!(record.x, 29.0);
    assert!(hub.write_count(CURSOR_NAMESPACE) < 30);
    assert_eq!(alice.session.stats().cursor_writes, 2);
}

#[tokio::test]
async fn test_session_excludes_own_cursor() {
    let backend = Arc::new(MemoryBackend::default());
    let hub = RegistryHub::default();
    let mut alice = join(&backend, &hub, "alice").await;
    let bob = join(&backend, &hub, "bob").await;

    bob.session.move_cursor(5.0, 6.0).await;
    alice.session.move_cursor(1.0, 1.0).await;

    let event = wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::Cursors(list) if !list.is_empty())
    })
    .await;
    if let SessionEvent::Cursors(list) = event {
        assert!(list.iter().all(|c| c.user_id != UserId::from("alice")));
        assert_eq!(list[0].display_name, "BOB");
    }
}

//! Session actor integration tests.
//!
//! Verifies:
//! - Two clients inserting at the same spot converge on one order
//! - Stale and duplicate sequence numbers are ignored
//! - A client that stops reading is dropped, others are not
//! - A failed save tells every client and fails the session
//! - Idle sessions close and save
//! - The log is compacted and a restarted session sees the same document

use std::sync::Arc;
use std::time::Duration;

use atlas_core::{Changeset, DocStore, Feature};
use atlas_sync::protocol::{ErrorKind, IncomingMessage, OutgoingMessage};
use atlas_sync::session::{Connection, Session, SessionConfig, SessionHandle, SessionStatus};
use atlas_sync::storage::{DocLog, MemoryDocLog};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Running {
    handle: SessionHandle,
    closed: mpsc::UnboundedReceiver<Uuid>,
    cancel: CancellationToken,
}

fn spawn_session(doc_id: Uuid, log: &MemoryDocLog, config: SessionConfig) -> Running {
    let (closed_tx, closed) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let handle = Session::spawn(doc_id, config, Arc::new(log.clone()), cancel.clone(), closed_tx);
    Running {
        handle,
        closed,
        cancel,
    }
}

/// Connect and return the connection with its welcome message.
async fn join(handle: &SessionHandle) -> (Connection, OutgoingMessage) {
    let mut conn = handle.connect(Uuid::new_v4()).await.unwrap();
    let welcome = conn.recv().await.unwrap();
    (conn, welcome)
}

fn edit(seq: i32, change: Changeset) -> IncomingMessage {
    IncomingMessage {
        seq,
        change: Some(change),
        ..IncomingMessage::default()
    }
}

fn add(id: &str, parent: &str, idx: &str) -> Changeset {
    let mut change = Changeset::new();
    change.add_feature(Feature::child(id, parent, idx));
    change
}

/// Apply broadcasts to `replica` until `done` holds for an ack map.
async fn follow(
    conn: &mut Connection,
    replica: &mut DocStore,
    mut done: impl FnMut(&OutgoingMessage) -> bool,
) -> Vec<OutgoingMessage> {
    let mut replies = Vec::new();
    loop {
        let msg = conn.recv().await.expect("session dropped the client");
        if msg.acks.is_none() {
            replies.push(msg);
            continue;
        }
        if let Some(change) = &msg.change {
            replica.update(change).unwrap();
        }
        if done(&msg) {
            return replies;
        }
    }
}

fn acked(msg: &OutgoingMessage, client: Uuid, seq: i32) -> bool {
    msg.acks
        .as_ref()
        .and_then(|acks| acks.get(&client))
        .is_some_and(|s| *s >= seq)
}

// ─── Convergence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_clients_converge_on_order() {
    let log = MemoryDocLog::new();
    let session = spawn_session(Uuid::new_v4(), &log, SessionConfig::for_testing());

    let (mut alice, _) = join(&session.handle).await;
    let (mut bob, _) = join(&session.handle).await;
    let (a, b) = (alice.client_id(), bob.client_id());

    // Both insert at the same position before seeing each other.
    alice.send(edit(1, add("a", "", "O"))).await.unwrap();
    bob.send(edit(1, add("b", "", "O"))).await.unwrap();

    let mut alice_view = DocStore::new();
    let mut bob_view = DocStore::new();
    let both = |msg: &OutgoingMessage| acked(msg, a, 1) && acked(msg, b, 1);
    let alice_replies = follow(&mut alice, &mut alice_view, both).await;
    let bob_replies = follow(&mut bob, &mut bob_view, both).await;

    assert!(alice_replies.is_empty());
    assert_eq!(bob_replies.len(), 1, "bob's insert collided and gets one fix");
    let fixed = bob_replies[0].change.as_ref().unwrap();
    assert!(fixed.fset.contains_key("b"));

    assert_eq!(alice_view.children(""), vec!["a", "b"]);
    assert_eq!(bob_view.children(""), vec!["a", "b"]);
    assert_eq!(alice_view.changes_after(0).1, bob_view.changes_after(0).1);

    let (_, welcome) = join(&session.handle).await;
    assert_eq!(welcome.change, alice_view.changes_after(0).1);
}

#[tokio::test]
async fn test_broadcast_carries_presence() {
    let log = MemoryDocLog::new();
    let session = spawn_session(Uuid::new_v4(), &log, SessionConfig::for_testing());
    let (alice, _) = join(&session.handle).await;
    let (mut bob, welcome) = join(&session.handle).await;
    assert_eq!(welcome.aware.as_ref().map(|aware| aware.len()), Some(2));

    let mut msg = IncomingMessage {
        seq: 1,
        ..IncomingMessage::default()
    };
    msg.aware.client_id = bob.client_id();
    msg.aware.selected_features = vec!["f1".into()];
    alice.send(msg).await.unwrap();

    loop {
        let out = bob.recv().await.unwrap();
        let Some(aware) = out.aware else { continue };
        let alice_aware = &aware[&alice.client_id()];
        if alice_aware.selected_features == vec!["f1".to_string()] {
            // A client cannot speak for someone else.
            assert_eq!(alice_aware.client_id, alice.client_id());
            assert!(aware[&bob.client_id()].selected_features.is_empty());
            break;
        }
    }
}

// ─── Sequencing ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stale_seq_is_ignored() {
    let log = MemoryDocLog::new();
    let session = spawn_session(Uuid::new_v4(), &log, SessionConfig::for_testing());
    let (conn, _) = join(&session.handle).await;

    conn.send(edit(5, add("a", "", "O"))).await.unwrap();
    conn.send(edit(5, add("b", "", "P"))).await.unwrap();
    conn.send(edit(3, add("c", "", "Q"))).await.unwrap();
    conn.send(edit(6, add("d", "", "R"))).await.unwrap();

    let stats = session.handle.stats().await.unwrap();
    assert_eq!(stats.generation, 2);

    let (_, welcome) = join(&session.handle).await;
    let snapshot = welcome.change.unwrap();
    assert_eq!(snapshot.fadd, vec!["a".to_string(), "d".to_string()]);
}

#[tokio::test]
async fn test_bad_update_is_refused_and_not_applied() {
    let log = MemoryDocLog::new();
    let session = spawn_session(Uuid::new_v4(), &log, SessionConfig::for_testing());
    let (mut conn, _) = join(&session.handle).await;

    let mut bad = add("a", "", "O");
    bad.fset.remove("a");
    conn.send(edit(1, bad)).await.unwrap();

    loop {
        let msg = conn.recv().await.unwrap();
        if let Some(error) = msg.error {
            assert!(matches!(error, ErrorKind::BadUpdate(_)));
            break;
        }
    }
    assert_eq!(session.handle.stats().await.unwrap().generation, 0);
}

// ─── Backpressure ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_slow_client_is_dropped() {
    let log = MemoryDocLog::new();
    let config = SessionConfig {
        outgoing_capacity: 3,
        ..SessionConfig::for_testing()
    };
    let session = spawn_session(Uuid::new_v4(), &log, config);
    let (mut fast, _) = join(&session.handle).await;
    // Never reads after connecting.
    let mut slow = session.handle.connect(Uuid::new_v4()).await.unwrap();

    for seq in 1..=6 {
        let idx = format!("{}", (b'A' + seq as u8) as char);
        fast.send(edit(seq, add(&format!("f{seq}"), "", &idx))).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        while fast.try_recv().is_some() {}
    }

    assert_eq!(session.handle.stats().await.unwrap().connections, 1);
    let mut queued = 0;
    while slow.recv().await.is_some() {
        queued += 1;
    }
    assert_eq!(queued, 3);
}

// ─── Persistence ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_save_failure_notifies_and_fails() {
    let log = MemoryDocLog::new();
    let mut session = spawn_session(Uuid::new_v4(), &log, SessionConfig::for_testing());
    let (mut conn, _) = join(&session.handle).await;

    log.set_fail_writes(true).await;
    conn.send(edit(1, add("a", "", "O"))).await.unwrap();

    let mut failure = None;
    while let Some(msg) = conn.recv().await {
        if let Some(error) = msg.error {
            failure = Some(error);
        }
    }
    assert!(matches!(failure, Some(ErrorKind::PersistenceFailure(_))));
    assert_eq!(session.closed.recv().await, Some(session.handle.doc_id()));
    assert_eq!(session.handle.closed().await, SessionStatus::Failed);
    assert!(session.handle.connect(Uuid::new_v4()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_closes_and_saves() {
    let log = MemoryDocLog::new();
    let doc_id = Uuid::new_v4();
    let config = SessionConfig {
        save_interval: Duration::from_secs(3600),
        ..SessionConfig::for_testing()
    };
    let mut session = spawn_session(doc_id, &log, config);
    let (conn, _) = join(&session.handle).await;
    conn.send(edit(1, add("a", "", "O"))).await.unwrap();
    conn.disconnect().await;

    assert_eq!(session.closed.recv().await, Some(doc_id));
    assert_eq!(session.handle.status(), SessionStatus::Closed);
    let entries = log.load(doc_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].changeset.fadd, vec!["a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_compaction_and_restart() {
    let log = MemoryDocLog::new();
    let doc_id = Uuid::new_v4();
    let mut session = spawn_session(doc_id, &log, SessionConfig::for_testing());
    let (conn, _) = join(&session.handle).await;

    // One save per edit; the sixth save exceeds the threshold of four.
    for seq in 1..=8 {
        let id = format!("f{seq}");
        let idx = format!("{}", (b'A' + seq as u8) as char);
        conn.send(edit(seq, add(&id, "", &idx))).await.unwrap();
        sleep(Duration::from_millis(60)).await;
    }
    let mut rename = Changeset::new();
    rename.set_feature(Feature::new("f3").with_name("harbour"));
    conn.send(edit(9, rename)).await.unwrap();

    let (_, before) = join(&session.handle).await;
    session.cancel.cancel();
    assert_eq!(session.closed.recv().await, Some(doc_id));

    assert!(log.head(doc_id).await > 1, "a snapshot replaced the oldest entries");
    assert!(log.row_count(doc_id).await < 8);

    let restarted = spawn_session(doc_id, &log, SessionConfig::for_testing());
    let (_, after) = join(&restarted.handle).await;
    assert_eq!(after.change, before.change);
    let snapshot = after.change.unwrap();
    assert_eq!(snapshot.fadd.len(), 8);
    assert_eq!(snapshot.fset["f3"].name.get().map(String::as_str), Some("harbour"));
}

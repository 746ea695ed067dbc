//! Scenario tests for the replication semantics, run in-process: two (or
//! three) sessions exchange operations and patches directly, without
//! sockets, so each step is deterministic.

use std::sync::Arc;
use std::time::Duration;

use entwine_collab::protocol::decode_patch;
use entwine_collab::session::{NullRedraw, Session};
use entwine_collab::storage::{OpLog, StoreConfig};
use entwine_collab::Operation;
use entwine_core::{Loc, ReplicaId};
use tempfile::TempDir;

const A: &str = "127.0.0.1:7001";
const B: &str = "127.0.0.1:7002";

fn session(addr: &str) -> (Arc<Session>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(OpLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    (Session::new(addr, store, Arc::new(NullRedraw)), dir)
}

/// Give fire-and-forget durable appends time to land before extracting
/// patches from the log.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// Drive the full two-phase sync, initiated by `a` against `b`, the way
/// the transport would.
fn run_sync(a: &Arc<Session>, b: &Arc<Session>, b_id: &str) {
    let args = a.build_phase_one_args(b_id);
    let reply = b.sync_phase_one(&args).expect("phase one");
    let phase_two = a.commit_phase_one(b_id, &reply).expect("commit");
    if let Some(args) = phase_two {
        b.sync_phase_two(&args).expect("phase two");
    }
}

#[tokio::test]
async fn concurrent_inserts_at_same_position_converge() {
    let (a, _da) = session(A);
    let (b, _db) = session(B);
    a.seed_text("ab").unwrap();
    b.seed_text("ab").unwrap();

    // Both replicas insert between 'a' and 'b' concurrently.
    let x = a.insert_at(Loc::new(1, 0), 'X').await;
    let y = b.insert_at(Loc::new(1, 0), 'Y').await;

    b.apply_insert(x.clone()).await;
    a.apply_insert(y.clone()).await;

    // Identical digits at the contested level; the replica tag decides.
    let expected = if ReplicaId::from_addr(A) < ReplicaId::from_addr(B) {
        "aXYb"
    } else {
        "aYXb"
    };
    assert_eq!(a.text(), expected);
    assert_eq!(b.text(), expected);
    assert_eq!(a.mirror_text(), expected);
    assert_eq!(b.mirror_text(), expected);
}

#[tokio::test]
async fn concurrent_insert_and_delete_commute() {
    let (a, _da) = session(A);
    let (b, _db) = session(B);
    a.seed_text("ab").unwrap();
    b.seed_text("ab").unwrap();

    // A appends 'Z' while B deletes 'b'.
    let ins = a.insert_at(Loc::new(2, 0), 'Z').await;
    let del = b.delete_at(Loc::new(1, 0)).await.unwrap();

    // Opposite application orders on each side.
    a.apply_delete(del.clone()).await;
    b.apply_insert(ins.clone()).await;

    assert_eq!(a.text(), "aZ");
    assert_eq!(b.text(), "aZ");
    assert_eq!(a.mirror_text(), b.mirror_text());
}

#[tokio::test]
async fn sync_after_partition() {
    let (a, _da) = session(A);
    let (b, _db) = session(B);
    a.seed_text("hello").unwrap();
    b.seed_text("hello").unwrap();
    // Each side has seen the other's seed history.
    a.load_clocks(vec![(B.into(), 5)]);
    b.load_clocks(vec![(A.into(), 5)]);

    // Partition: A types " world" (clocks 6..11), B deletes 'h' (clock 6).
    for (i, ch) in " world".chars().enumerate() {
        a.insert_at(Loc::new(5 + i, 0), ch).await;
    }
    b.delete_at(Loc::new(0, 0)).await.unwrap();
    settle().await;

    assert_eq!(a.local_clock(), 11);
    assert_eq!(b.local_clock(), 6);

    // Reconnect; A initiates.
    run_sync(&a, &b, B);

    assert_eq!(a.text(), "ello world");
    assert_eq!(b.text(), "ello world");
    assert_eq!(a.clock_of(B), 6);
    assert_eq!(b.clock_of(A), 11);
    assert_eq!(a.mirror_text(), "ello world");
    assert_eq!(b.mirror_text(), "ello world");
}

#[tokio::test]
async fn sync_when_only_receiver_has_news() {
    // A already has everything B saw from it; only B's tail is missing
    // on A, so the whole exchange finishes in phase one.
    let (a, _da) = session(A);
    let (b, _db) = session(B);
    a.seed_text("hello").unwrap();
    b.seed_text("hello").unwrap();
    a.load_clocks(vec![(B.into(), 5)]);
    b.load_clocks(vec![(A.into(), 5)]);

    // A types five more chars and B applies them live.
    for (i, ch) in "musth".chars().enumerate() {
        let args = a.insert_at(Loc::new(5 + i, 0), ch).await;
        b.apply_insert(args).await;
    }
    // B types two chars A never saw.
    b.insert_at(Loc::new(10, 0), '!').await;
    b.insert_at(Loc::new(11, 0), '?').await;
    settle().await;

    assert_eq!(a.local_clock(), 10);
    assert_eq!(b.clock_of(A), 10);
    assert_eq!(b.local_clock(), 7);
    assert_eq!(a.clock_of(B), 5);

    let args = a.build_phase_one_args(B);
    let reply = b.sync_phase_one(&args).unwrap();
    // The receiver has everything from the initiator already.
    assert!(!reply.phase_two);
    let patch = decode_patch(&reply.patch).unwrap();
    assert_eq!(patch.iter().map(|o| o.clock).collect::<Vec<_>>(), vec![6, 7]);

    assert!(a.commit_phase_one(B, &reply).unwrap().is_none());
    assert_eq!(a.text(), b.text());
    assert_eq!(a.clock_of(B), 7);
}

#[tokio::test]
async fn divergent_initiator_is_rejected_without_changes() {
    let (a, _da) = session(A);
    let (b, _db) = session(B);
    a.seed_text("0123456789").unwrap(); // Clock[self] = 10
    b.seed_text("0123456789").unwrap();
    // B somehow observed A at clock 12 — A's storage must have rolled
    // back. The sync must abort and change nothing.
    b.load_clocks(vec![(A.into(), 12)]);

    let args = a.build_phase_one_args(B);
    assert_eq!(args.sender_clock, 10);
    let err = b.sync_phase_one(&args).unwrap_err();
    assert!(err.to_string().contains("divergence"));

    assert_eq!(a.text(), "0123456789");
    assert_eq!(b.text(), "0123456789");
    assert_eq!(b.clock_of(A), 12);
}

#[tokio::test]
async fn recorded_history_replays_into_fresh_replica() {
    let (a, _da) = session(A);

    for (i, ch) in "entangle".chars().enumerate() {
        a.insert_at(Loc::new(i, 0), ch).await;
    }
    a.delete_at(Loc::new(3, 0)).await.unwrap();
    a.insert_at(Loc::new(3, 0), '\n').await;
    settle().await;
    let original = a.text();

    let ops: Vec<Operation> = a
        .store()
        .extract_between(1, a.store().last_op_id().unwrap())
        .unwrap();
    let (fresh, _dir) = session(B);
    fresh.apply_patch(&ops);

    assert_eq!(fresh.text(), original);
    assert_eq!(fresh.mirror_text(), original);
}

#[tokio::test]
async fn patch_overlapping_applied_history_is_safe() {
    let (a, _da) = session(A);
    let (b, _db) = session(B);

    for (i, ch) in "abcd".chars().enumerate() {
        let args = a.insert_at(Loc::new(i, 0), ch).await;
        b.apply_insert(args).await;
    }
    settle().await;

    // B already applied everything live; a full-history patch replays
    // without duplicating a single atom.
    let ops = a.store().extract_between(1, 4).unwrap();
    assert_eq!(b.apply_patch(&ops), 0);
    assert_eq!(b.text(), "abcd");
}

#[tokio::test]
async fn three_replicas_converge_through_pairwise_exchange() {
    let (a, _da) = session(A);
    let (b, _db) = session(B);
    let c_id = "127.0.0.1:7003";
    let (c, _dc) = session(c_id);

    let x = a.insert_at(Loc::new(0, 0), 'x').await;
    let y = b.insert_at(Loc::new(0, 0), 'y').await;

    // Fan the two concurrent ops to everyone, in different orders.
    b.apply_insert(x.clone()).await;
    a.apply_insert(y.clone()).await;
    c.apply_insert(y).await;
    c.apply_insert(x).await;

    assert_eq!(a.text(), b.text());
    assert_eq!(b.text(), c.text());
    assert_eq!(a.text().len(), 2);
}

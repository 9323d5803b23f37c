mod common;

use std::sync::Arc;

use crossbeam_channel::unbounded;

use xtalsearch::core::candidate::Status;
use xtalsearch::engine::store::{StoreEvent, Structure, Tracker};

use common::make_candidate;

#[test]
fn append_assigns_dense_insertion_ordinals() {
    let (tx, _rx) = unbounded();
    let tracker = Tracker::new(tx);

    for i in 0..5 {
        let s = Structure::new(make_candidate(1, i + 1, -1.0));
        assert!(tracker.append(s));
    }

    assert_eq!(tracker.size(), 5);
    for (i, s) in tracker.list().iter().enumerate() {
        assert_eq!(s.read().index, i);
    }
}

#[test]
fn append_emits_events_after_the_write_lock_is_released() {
    let (tx, rx) = unbounded();
    let tracker = Tracker::new(tx);

    let s = Structure::new(make_candidate(1, 1, -1.0));
    tracker.append(Arc::clone(&s));

    match rx.recv().unwrap() {
        StoreEvent::NewStructureAdded(added) => {
            assert!(Arc::ptr_eq(&added, &s));
            // The lock must be free by the time the event is delivered.
            assert_eq!(added.read().status, Status::WaitingForOptimization);
        }
        other => panic!("expected NewStructureAdded, got {other:?}"),
    }
    match rx.recv().unwrap() {
        StoreEvent::StructureCountChanged(n) => assert_eq!(n, 1),
        other => panic!("expected StructureCountChanged, got {other:?}"),
    }
}

#[test]
fn append_refuses_the_same_structure_twice() {
    let (tx, _rx) = unbounded();
    let tracker = Tracker::new(tx);
    let s = Structure::new(make_candidate(1, 1, -1.0));

    assert!(tracker.append(Arc::clone(&s)));
    assert!(!tracker.append(Arc::clone(&s)));
    assert_eq!(tracker.size(), 1);
}

#[test]
fn append_and_unlock_publishes_a_held_candidate() {
    let (tx, _rx) = unbounded();
    let tracker = Tracker::new(tx);
    let s = Structure::new(make_candidate(2, 9, -3.0));

    let guard = s.write();
    assert!(tracker.append_and_unlock(&s, guard));
    // The guard is gone; reading must not deadlock.
    assert_eq!(s.read().id_number, 9);
    assert!(tracker.contains(&s));
}

#[test]
fn pop_first_dequeues_in_insertion_order() {
    let (tx, _rx) = unbounded();
    let tracker = Tracker::new(tx);

    for i in 0..3 {
        tracker.append(Structure::new(make_candidate(1, i + 1, -1.0)));
    }

    let first = tracker.pop_first().unwrap();
    assert_eq!(first.read().id_number, 1);
    let second = tracker.pop_first().unwrap();
    assert_eq!(second.read().id_number, 2);
    assert_eq!(tracker.size(), 1);

    tracker.pop_first().unwrap();
    assert!(tracker.pop_first().is_none());
}

#[test]
fn remove_and_contains_work_by_identity() {
    let (tx, _rx) = unbounded();
    let tracker = Tracker::new(tx);

    let s1 = Structure::new(make_candidate(1, 1, -1.0));
    let s2 = Structure::new(make_candidate(1, 2, -2.0));
    tracker.append(Arc::clone(&s1));
    tracker.append(Arc::clone(&s2));

    assert!(tracker.contains(&s1));
    assert!(tracker.remove(&s1));
    assert!(!tracker.contains(&s1));
    assert!(!tracker.remove(&s1));
    assert_eq!(tracker.size(), 1);
    assert!(tracker.at(0).map(|s| Arc::ptr_eq(&s, &s2)).unwrap_or(false));
}

#[test]
fn reset_restarts_index_assignment() {
    let (tx, _rx) = unbounded();
    let tracker = Tracker::new(tx);

    tracker.append(Structure::new(make_candidate(1, 1, -1.0)));
    tracker.append(Structure::new(make_candidate(1, 2, -1.0)));
    tracker.reset();
    assert_eq!(tracker.size(), 0);

    let s = Structure::new(make_candidate(1, 3, -1.0));
    tracker.append(Arc::clone(&s));
    assert_eq!(s.read().index, 0);
}

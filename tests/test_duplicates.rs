mod common;

use std::sync::Arc;

use crossbeam_channel::unbounded;

use xtalsearch::core::candidate::{Candidate, Status};
use xtalsearch::core::cell::UnitCell;
use xtalsearch::engine::duplicates::DuplicateChecker;
use xtalsearch::engine::store::{Structure, Tracker};

use common::make_candidate;

fn optimized(generation: u32, id: u32, spacegroup: u32, enthalpy: f64, volume: f64) -> Candidate {
    let edge = volume.cbrt();
    let mut c = make_candidate(generation, id, enthalpy);
    c.cell = UnitCell::new(edge, edge, edge, 90.0, 90.0, 90.0);
    c.spacegroup = spacegroup;
    c.status = Status::Optimized;
    c
}

fn checker(tracker: &Arc<Tracker>) -> Arc<DuplicateChecker> {
    DuplicateChecker::new(Arc::clone(tracker), 1e-2, 1e-1, 0.05)
}

#[test]
fn the_higher_enthalpy_twin_is_marked() {
    let (tx, _rx) = unbounded();
    let tracker = Arc::new(Tracker::new(tx));

    let keep = Structure::new(optimized(1, 1, 225, -10.0001, 50.0005));
    let lose = Structure::new(optimized(1, 2, 225, -10.00, 50.0));
    tracker.append(Arc::clone(&keep));
    tracker.append(Arc::clone(&lose));

    checker(&tracker).scan();

    assert_eq!(keep.read().status, Status::Optimized);
    let losing = lose.read();
    assert_eq!(losing.status, Status::Duplicate);
    assert_eq!(losing.duplicate_of.as_deref(), Some("1x1"));
}

#[test]
fn exactly_one_of_a_matching_pair_is_marked() {
    let (tx, _rx) = unbounded();
    let tracker = Arc::new(Tracker::new(tx));

    let a = Structure::new(optimized(1, 1, 194, -4.0, 80.0));
    let b = Structure::new(optimized(1, 2, 194, -4.001, 80.001));
    tracker.append(Arc::clone(&a));
    tracker.append(Arc::clone(&b));

    checker(&tracker).scan();

    let marked = [&a, &b]
        .iter()
        .filter(|s| s.read().status == Status::Duplicate)
        .count();
    assert_eq!(marked, 1);
    // b has the lower enthalpy, so a must be the duplicate.
    assert_eq!(a.read().status, Status::Duplicate);
}

#[test]
fn equal_enthalpies_fall_back_to_the_larger_index() {
    let (tx, _rx) = unbounded();
    let tracker = Arc::new(Tracker::new(tx));

    let older = Structure::new(optimized(1, 1, 221, -7.0, 60.0));
    let younger = Structure::new(optimized(1, 2, 221, -7.0, 60.0));
    tracker.append(Arc::clone(&older));
    tracker.append(Arc::clone(&younger));

    checker(&tracker).scan();

    assert_eq!(older.read().status, Status::Optimized);
    assert_eq!(younger.read().status, Status::Duplicate);
    assert_eq!(younger.read().duplicate_of.as_deref(), Some("1x1"));
}

#[test]
fn a_marked_duplicate_never_serves_as_representative() {
    let (tx, _rx) = unbounded();
    let tracker = Arc::new(Tracker::new(tx));

    // Three structures matching pairwise. Both losers must point at the
    // lowest-enthalpy survivor, never at another duplicate.
    let a = Structure::new(optimized(1, 1, 225, -10.0, 50.0));
    let b = Structure::new(optimized(1, 2, 225, -9.999, 50.0));
    let c = Structure::new(optimized(1, 3, 225, -9.998, 50.0));
    tracker.append(Arc::clone(&a));
    tracker.append(Arc::clone(&b));
    tracker.append(Arc::clone(&c));

    checker(&tracker).scan();

    assert_eq!(a.read().status, Status::Optimized);
    assert_eq!(b.read().status, Status::Duplicate);
    assert_eq!(c.read().status, Status::Duplicate);
    assert_eq!(b.read().duplicate_of.as_deref(), Some("1x1"));
    assert_eq!(c.read().duplicate_of.as_deref(), Some("1x1"));
}

#[test]
fn mismatched_fingerprints_are_left_alone() {
    let (tx, _rx) = unbounded();
    let tracker = Arc::new(Tracker::new(tx));

    // Different space groups.
    let a = Structure::new(optimized(1, 1, 225, -10.0, 50.0));
    let b = Structure::new(optimized(1, 2, 194, -10.0, 50.0));
    // Same group, enthalpy outside the tolerance.
    let c = Structure::new(optimized(1, 3, 100, -3.0, 50.0));
    let d = Structure::new(optimized(1, 4, 100, -3.5, 50.0));
    // Unknown space group is never compared.
    let e = Structure::new(optimized(1, 5, 0, -10.0, 50.0));
    let f = Structure::new(optimized(1, 6, 0, -10.0, 50.0));

    for s in [&a, &b, &c, &d, &e, &f] {
        tracker.append(Arc::clone(s));
    }
    checker(&tracker).scan();

    for s in [a, b, c, d, e, f] {
        assert_eq!(s.read().status, Status::Optimized);
    }
}

#[test]
fn non_optimized_candidates_are_ignored() {
    let (tx, _rx) = unbounded();
    let tracker = Arc::new(Tracker::new(tx));

    let mut pending = optimized(1, 1, 225, -10.0, 50.0);
    pending.status = Status::WaitingForOptimization;
    let a = Structure::new(pending);
    let b = Structure::new(optimized(1, 2, 225, -10.0, 50.0));
    tracker.append(Arc::clone(&a));
    tracker.append(Arc::clone(&b));

    checker(&tracker).scan();

    assert_eq!(a.read().status, Status::WaitingForOptimization);
    assert_eq!(b.read().status, Status::Optimized);
}

#[test]
fn reset_reverts_and_rescans() {
    let (tx, _rx) = unbounded();
    let tracker = Arc::new(Tracker::new(tx));

    // Identical cubic cells: the metric classifier agrees on a space
    // group after reset, so the pair is rediscovered.
    let keep = Structure::new(optimized(1, 1, 225, -10.0, 64.0));
    let lose = Structure::new(optimized(1, 2, 225, -10.0, 64.0));
    tracker.append(Arc::clone(&keep));
    tracker.append(Arc::clone(&lose));

    let checker = checker(&tracker);
    checker.scan();
    assert_eq!(lose.read().status, Status::Duplicate);

    checker.reset_duplicates();

    // Space groups were recomputed from the lattice metric.
    assert_ne!(keep.read().spacegroup, 225);
    let marked = [&keep, &lose]
        .iter()
        .filter(|s| s.read().status == Status::Duplicate)
        .count();
    assert_eq!(marked, 1);
    assert_eq!(lose.read().status, Status::Duplicate);
}
